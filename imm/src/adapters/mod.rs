// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod cli;
pub mod credentials;
pub mod manifest;
pub mod progress;
pub mod shell;
pub mod time;
