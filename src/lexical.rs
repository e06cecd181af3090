//! Export name ordering
//!
//! Export name tables are sorted so loaders can binary search them.
//! Names are ordered by [`compare_names`], which is not plain byte order.
use core::cmp::Ordering;

/// Compare two export names
///
/// Characters are compared pairwise. At the first pair that differs:
///
/// - A digit sorts before a non-digit
/// - Then, an uppercase letter sorts before anything that isn't
/// - Then, `_` sorts before anything else
/// - Otherwise, the lower code point sorts first
///
/// If one name is a prefix of the other, the shorter sorts first.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    for (x, y) in a.chars().zip(b.chars()) {
        if x != y {
            return compare_chars(x, y);
        }
    }
    a.chars().count().cmp(&b.chars().count())
}

fn compare_chars(x: char, y: char) -> Ordering {
    let digit = (x.is_ascii_digit(), y.is_ascii_digit());
    let upper = (x.is_uppercase(), y.is_uppercase());
    match (digit, upper) {
        ((true, false), _) => Ordering::Less,
        ((false, true), _) => Ordering::Greater,
        (_, (true, false)) => Ordering::Less,
        (_, (false, true)) => Ordering::Greater,
        _ if x == '_' => Ordering::Less,
        _ if y == '_' => Ordering::Greater,
        _ => x.cmp(&y),
    }
}
