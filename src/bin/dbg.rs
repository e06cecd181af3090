//! Dump a PE image, its imports, and its exports
use std::{env, error::Error, fs};

use pecoff::{DataDirIdent, Pe};

fn main() -> Result<(), Box<dyn Error>> {
    let path = env::args_os().nth(1).ok_or("usage: dbg <image>")?;
    let bytes = fs::read(&path)?;
    let pe = Pe::from_bytes(&bytes)?;
    dbg!(&pe);

    for id in DataDirIdent::ALL {
        let dir = pe.data_dir(id);
        if dir.is_present() {
            println!("{id}: {:#x} ({:#x} bytes)", dir.rva, dir.size);
        }
    }

    if let Some(imports) = pe.imports() {
        for lib in &imports.libraries {
            println!("import {}", lib.name.as_deref().unwrap_or("<unreadable>"));
            for sym in &lib.symbols {
                println!("    {sym:?}");
            }
        }
    }

    if let Some(exports) = pe.exports() {
        println!(
            "exports of {}, base {}",
            exports.image_name.as_deref().unwrap_or("<unnamed>"),
            exports.ordinal_base
        );
        for (i, sym) in exports.symbols.iter().enumerate() {
            let ordinal = exports.ordinal_base.wrapping_add(i as u32);
            match sym.name() {
                Some(name) => println!("    {ordinal:>5} {:#010x} {name}", sym.address()),
                None => println!("    {ordinal:>5} {:#010x}", sym.address()),
            }
        }
    }
    Ok(())
}
