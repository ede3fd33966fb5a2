//! Backup protocol implementation.
//!
//! A binary request/response protocol for storing, restoring, deleting and
//! listing files in a per-user namespace:
//! - Client sends: a 6-byte header `user_id:u32 version:u8 op:u8` plus an
//!   operation-specific body
//! - Server responds: a 3-byte header `version:u8 status:u16` plus a
//!   status-specific body
//!
//! ## Operations
//!
//! | Op | Code | Body |
//! |---|---|---|
//! | BACKUP | 100 | name_len, name, payload_len, payload |
//! | RESTORE | 200 | name_len, name |
//! | DELETE_FILE | 201 | name_len, name |
//! | LIST_FILES | 202 | (none) |
//!
//! ## Statuses
//!
//! | Status | Code | Body |
//! |---|---|---|
//! | RESTORE_SUCCESS | 210 | name_len, name, content_len, content |
//! | LIST_SUCCESS | 211 | name_len, name, content_len, content |
//! | GENERAL_SUCCESS | 212 | name_len, name |
//! | ERROR_NO_FILE | 1001 | name_len, name |
//! | ERROR_NO_FILES_FOR_CLIENT | 1002 | (none) |
//! | ERROR_GENERAL | 1003 | name_len, name |
//!
//! All integers are little-endian. Requests on one connection are handled
//! strictly in order.

pub mod handler;
pub mod parser;
pub mod response;

pub use handler::handle_connection;
