//! Document CRUD engine: encode/decode/cast (`encode.rs`) plus the pure
//! diff/merge helpers consumed by `Database`'s create/update/delete paths
//! (§4.1 "Document engine — public contract").

pub mod document;
pub mod encode;
