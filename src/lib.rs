pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod editor_link;
pub mod error;
pub mod exam_package;
pub mod export;
pub mod models;
pub mod outcome;
pub mod receipt;
pub mod remark;
pub mod routes;
pub mod scorm_diff;
pub mod store;
pub mod sweep;
pub mod tasks;
