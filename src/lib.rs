//! xcbolt: a driver for Apple's command-line build toolchain.
//!
//! Turns `xcodebuild`, `simctl`, `devicectl`, and `xcresulttool` into a
//! reproducible pipeline that builds, tests, installs, launches, and
//! observes an app from one configuration document, with a structured
//! event stream for scripts and CI.

pub mod bundle;
pub mod cancel;
pub mod config;
pub mod destination;
pub mod event;
pub mod logsink;
pub mod logstream;
pub mod pipeline;
pub mod process;
pub mod project;
pub mod session;
pub mod tools;
pub mod watch;
