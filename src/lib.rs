//! Minimal group-chat relay: a request/reply control channel for group
//! management plus a fan-out broadcast channel for chat delivery.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] provides the pipe-delimited line protocol (requests,
//!   replies, broadcast frames) plus helpers for async reads and writes.
//! - [`registry`] owns group existence and membership.
//! - [`server`] accepts TCP connections, serializes all registry access
//!   through one dispatcher task, and fans broadcasts out over a Tokio
//!   `broadcast` channel.
//! - [`client`] drives the interactive command loop over a strict
//!   send-then-receive control connection.
//! - [`receiver`] runs the client's subscription coordinator: a polling
//!   receive loop that owns the topic filter and drains queued
//!   subscriptions each cycle.
//!
//! Integration and unit tests use this crate directly to exercise the
//! dispatcher state machine and the wire protocol.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod server;
