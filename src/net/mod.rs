// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

pub mod tls;
pub mod transport;

pub use self::transport::Transport;
