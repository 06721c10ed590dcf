pub mod action;
pub mod agent;
pub mod browser;
pub mod config;
pub mod effectors;
pub mod guard;
pub mod oracle;
pub mod remote;
pub mod rpc;
pub mod server;
pub mod tools;

pub use agent::{ComputerAgent, Desktop, JobOutcome, JobStatus, Screenshot};
pub use browser::{Browser, BrowserConfig, BrowserSession};
pub use config::BridgeConfig;
pub use oracle::{DecisionClient, Oracle};
pub use server::{router, BridgeService};
pub use tools::{ToolCallResult, Toolbox};
