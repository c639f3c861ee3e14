//! 服务模块

pub mod memory_service;

pub use memory_service::{
    AddMemoryRequest, AddResult, MemoryService, MemoryServiceBuilder, SearchRequest, SearchResult,
};
