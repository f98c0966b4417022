//! Key universe of a keyspace.
//!
//! Keys are never stored: index `i` of keyspace `k` is rendered on demand as
//! the number `i * stride + k` in the run's key alphabet, left padded with
//! its zero digit to the key length. Base 62 printable keys are used unless
//! some keyspace needs more distinct keys than its length allows, in which
//! case every byte value is a digit. This keeps keys unique within and
//! across keyspaces and makes `key_for` a pure function of its arguments.

use rand::Rng;

use crate::config::{KeyAlphabet, Keyspace};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Renders the key at `index` (in `[0, count)`) into `buf`, replacing its content.
pub fn write_key(keyspace: &Keyspace, index: u64, buf: &mut Vec<u8>) {
    debug_assert!(index < keyspace.count, "key index out of range");

    let alphabet = keyspace.alphabet;
    let radix = alphabet.radix();
    let digit = |value: u128| match alphabet {
        KeyAlphabet::Printable => ALPHABET[value as usize],
        KeyAlphabet::Binary => value as u8,
    };

    buf.clear();
    buf.resize(keyspace.length, digit(0));

    let mut n = index as u128 * keyspace.stride as u128 + keyspace.ordinal as u128;
    for slot in buf.iter_mut().rev() {
        if n == 0 {
            break;
        }
        *slot = digit(n % radix);
        n /= radix;
    }
}

pub fn key_for(keyspace: &Keyspace, index: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(keyspace.length);
    write_key(keyspace, index, &mut buf);
    buf
}

/// Draws a key index uniformly from `[0, count)`.
pub fn select_key<R: Rng + ?Sized>(keyspace: &Keyspace, rng: &mut R) -> u64 {
    rng.random_range(0..keyspace.count)
}
