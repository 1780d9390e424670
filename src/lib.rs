pub mod clock;
pub mod completion;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod outbound;
pub mod payment;
pub mod recipient;
pub mod reminder;
pub mod service;
pub mod signing;
pub mod store;
pub mod token;
pub mod utils;
pub mod verification;
pub mod version;
