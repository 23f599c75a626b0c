#![allow(missing_docs)]

mod fetcher;
mod sync;

const fn main() {}
