// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

pub mod access_log;
pub mod cgi;
pub mod config;
pub mod connection;
pub mod context;
pub mod handler;
pub mod http;
pub mod net;
pub mod resources;
pub mod scheduler;

pub use self::{
    config::ServerConfig,
    scheduler::{Server, ServerHandle},
};
