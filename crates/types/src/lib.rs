//! Core types for the tessera single-table mapping layer.
//!
//! This crate provides the vocabulary shared by the mapper and by store
//! implementations:
//! - Attribute values and items
//! - The [`Store`] capability and its request/response shapes
//! - Store errors and stable error codes (snafu)
//! - Configuration for batching and retry
//! - Identifier validation and the postcard codec

pub mod codec;
pub mod config;
pub mod error;
pub mod store;
pub mod validation;
pub mod value;

// Re-export commonly used types at crate root
pub use error::{ErrorCode, StoreError};
pub use store::{
    BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, DeleteRequest,
    ExpressionAttributes, GetRequest, Page, PutRequest, QueryRequest, ReturnValues, ScanRequest,
    Store, StoreResult, UpdateRequest, WriteRequest,
};
pub use value::{AttributeValue, Item};
