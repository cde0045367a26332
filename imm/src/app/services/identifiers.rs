// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::LazyLock;

use regex::Regex;

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+'-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$";
const GUID_PATTERN: &str =
    r"^\{?[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}\}?$";

static EMAIL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(EMAIL_PATTERN).ok());
static GUID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(GUID_PATTERN).ok());

/// UPN / SMTP address syntax.
pub fn is_valid_email(value: &str) -> bool {
    !value.contains("..") && EMAIL.as_ref().is_some_and(|re| re.is_match(value))
}

pub fn is_guid(value: &str) -> bool {
    GUID.as_ref().is_some_and(|re| re.is_match(value))
}
