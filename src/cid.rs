// SPDX-License-Identifier: MIT
//! Channel identifiers
//!
//! A channel is named `OBJTYPE~NAME1~NAME2~OBJTYPE_PK~ATTRTYPE`. The form
//! without the primary key, `OBJTYPE~NAME1~NAME2~ATTRTYPE`, stays stable
//! across model versions in which object keys were regenerated.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Separator between CID fields
pub const SEPARATOR: char = '~';

static FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^~\s]+)~([^~\t\r\n]*)~([^~\s]*)~(-?\d+)~([^~\s]+)$")
        .expect("Invalid regex pattern for channel identifiers")
});

static WITHOUT_PK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^~\s]+)~([^~\t\r\n]*)~([^~\s]*)~([^~\s]+)$")
        .expect("Invalid regex pattern for channel identifiers without primary key")
});

/// Parsed channel identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    pub objtype: String,
    pub name1: String,
    pub name2: String,
    /// `None` for identifiers parsed from the form without primary key
    pub pk: Option<String>,
    pub attrtype: String,
}

impl Cid {
    pub fn new(
        objtype: impl Into<String>,
        name1: impl Into<String>,
        name2: impl Into<String>,
        pk: impl Into<String>,
        attrtype: impl Into<String>,
    ) -> Self {
        Self {
            objtype: objtype.into(),
            name1: name1.into(),
            name2: name2.into(),
            pk: Some(pk.into()),
            attrtype: attrtype.into(),
        }
    }

    /// Parse the full form `OBJTYPE~NAME1~NAME2~OBJTYPE_PK~ATTRTYPE`
    pub fn parse(text: &str) -> Option<Self> {
        let caps = FULL.captures(text)?;
        Some(Self {
            objtype: caps[1].to_string(),
            name1: caps[2].to_string(),
            name2: caps[3].to_string(),
            pk: Some(caps[4].to_string()),
            attrtype: caps[5].to_string(),
        })
    }

    /// Parse the form without primary key `OBJTYPE~NAME1~NAME2~ATTRTYPE`
    pub fn parse_without_pk(text: &str) -> Option<Self> {
        let caps = WITHOUT_PK.captures(text)?;
        Some(Self {
            objtype: caps[1].to_string(),
            name1: caps[2].to_string(),
            name2: caps[3].to_string(),
            pk: None,
            attrtype: caps[4].to_string(),
        })
    }

    /// Render without the primary key
    pub fn without_pk(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.objtype,
            self.name1,
            self.name2,
            self.attrtype,
            sep = SEPARATOR
        )
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pk {
            Some(pk) => write!(
                f,
                "{}{sep}{}{sep}{}{sep}{}{sep}{}",
                self.objtype,
                self.name1,
                self.name2,
                pk,
                self.attrtype,
                sep = SEPARATOR
            ),
            None => f.write_str(&self.without_pk()),
        }
    }
}

/// Join raw schema fields into the full identifier
///
/// Vector channels carry placeholders (`*`) instead of names and keys, so
/// the result is not guaranteed to satisfy [`Cid::parse`].
pub fn compose(objtype: &str, name1: &str, name2: &str, pk: &str, attrtype: &str) -> String {
    format!(
        "{objtype}{sep}{name1}{sep}{name2}{sep}{pk}{sep}{attrtype}",
        sep = SEPARATOR
    )
}

/// Normalize either identifier form to the form without primary key
///
/// Returns `None` when the text is neither form.
pub fn normalize(text: &str) -> Option<String> {
    Cid::parse(text)
        .or_else(|| Cid::parse_without_pk(text))
        .map(|cid| cid.without_pk())
}
