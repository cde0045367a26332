// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod credentials;
pub mod progress;
pub mod remote_command;

pub use clock::ClockPort;
pub use credentials::{CredentialProvider, CredentialUnavailable};
pub use progress::{BatchEvent, NoopProgress, ProgressSink};
pub use remote_command::{RemoteCommandPort, TransportError};
