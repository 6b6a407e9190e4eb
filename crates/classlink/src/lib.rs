//
// lib.rs
//
// Library target shared by the binary and integration tests
//

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod document_store;
pub mod entry;
pub mod language;
pub mod model_cache;
pub mod modes;
pub mod names;
pub mod reference_map;
pub mod remote_cache;
pub mod request;
pub mod state;
pub mod syntax;
pub mod uri;

#[cfg(test)]
pub mod test_utils;
