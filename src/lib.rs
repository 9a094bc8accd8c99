pub mod alarm_engine;
pub mod buffer;
pub mod config;
pub mod config_db;
pub mod fields;
pub mod handlers;
pub mod index;
pub mod models;
pub mod notify;
pub mod offsets;
pub mod query;
pub mod redaction;
pub mod retention;
pub mod scanner;
pub mod search;

use std::sync::Arc;

use buffer::LogBuffer;
use config_db::ConfigDb;
use fields::FieldRegistry;
use index::IndexStore;
use redaction::RedactionEngine;
use retention::RetentionExecutor;
use scanner::Scanner;
use search::SearchExecutor;

#[derive(Clone)]
pub struct AppState {
    pub config_db: Arc<ConfigDb>,
    pub index: Arc<IndexStore>,
    pub search: SearchExecutor,
    pub buffer: LogBuffer,
    pub scanner: Scanner,
    pub retention: Arc<RetentionExecutor>,
    pub redaction: Arc<RedactionEngine>,
    pub fields: Arc<FieldRegistry>,
}
