//! A multi-threaded HTTP/1.x client and server engine built on a shared,
//! pluggable protocol core: a thread-pool scheduler that multiplexes
//! non-blocking sockets across worker threads, and the HTTP connection
//! state machines it hosts.
//!
//! ```no_run
//! use latypus::config::Config;
//! use latypus::engine::Engine;
//!
//! let config = Config::from_file("engine.conf").unwrap();
//! let engine = Engine::new(config).unwrap();
//! engine.run().unwrap();
//! ```

extern crate libc;
extern crate net2;
#[macro_use]
extern crate log;

pub mod epoll;
pub mod net;
mod sys;

pub mod queue;
pub mod registry;
pub mod timer;
pub mod error;

pub mod config;
pub mod engine;
pub mod thread;
pub mod http;
pub mod handlers;

pub use error::{Error, Result};
