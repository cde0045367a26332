// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod backoff;
pub mod batch;
pub mod identifiers;
pub mod jobs;
pub mod random;
pub mod redact;
pub mod session;
pub mod validation;
