//! Test helpers for byte-level fixtures.

#![allow(dead_code)]

use std::io::Cursor;

use hex::decode;

pub(crate) fn hex_to_cursor(data: &str) -> Cursor<Vec<u8>> {
    let data = data.replace(' ', "");
    let data = data.replace('\n', "");
    let data = decode(data).expect("while decoding hex data from string");
    Cursor::new(data)
}

pub(crate) fn hex_to_bytes(data: &str) -> Vec<u8> {
    hex_to_cursor(data).into_inner()
}
