//! Core of the MKB gateway: plan sessions, the planner and step executor
//! that drive them, and the clients for the services they depend on.

pub mod agent;
pub mod chat;
pub mod error;
pub mod files;
pub mod knowledge;
pub mod llm;
pub mod planner;
pub mod session;
pub mod signing;
pub mod step;
pub mod storage;
