//! [`BrowserSession`](crate::traits::BrowserSession) implementations.
//!
//! - [`webdriver`] - attaches to a live W3C WebDriver session
//! - [`memory`] - canned in-memory feed for tests and snapshot replay

pub mod memory;
pub mod webdriver;

pub use memory::{MemoryContainer, MemorySession};
pub use webdriver::WebDriverSession;
