use std::collections::{BTreeSet, HashSet};

use scip::symbol::parse_symbol;

use crate::db::models::{Moniker, PackageInformation, QualifiedMoniker};
use crate::error::{CodeNavError, Result};

/// Marker prefix of synthetic symbols that are only meaningful inside one bundle.
pub const BUNDLE_LOCAL_SYMBOL_PREFIX: &str = "lsif .";

const LOCAL_SYMBOL_PREFIX: &str = "local ";

pub fn is_bundle_local_symbol(symbol_name: &str) -> bool {
    symbol_name.starts_with(BUNDLE_LOCAL_SYMBOL_PREFIX)
}

/// Document-local symbols never match anything outside their document.
pub fn is_local_symbol(symbol_name: &str) -> bool {
    symbol_name.starts_with(LOCAL_SYMBOL_PREFIX)
}

/// Ordered set of qualified monikers, deduplicated on
/// (manager, name, version, scheme, identifier).
#[derive(Debug, Clone, Default)]
pub struct MonikerCollector {
    monikers: Vec<QualifiedMoniker>,
    seen: HashSet<QualifiedMoniker>,
}

impl MonikerCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a deduplicated, lexicographically ordered set of symbol names.
    /// Bundle-local and document-local symbols are left out.
    pub fn from_symbol_names<'a, I>(symbol_names: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ordered: BTreeSet<&str> = symbol_names
            .into_iter()
            .filter(|name| !is_bundle_local_symbol(name) && !is_local_symbol(name))
            .collect();

        let mut collector = Self::new();
        for symbol_name in ordered {
            collector.add(qualify_symbol(symbol_name)?);
        }
        Ok(collector)
    }

    /// Returns false when an equal moniker is already present.
    pub fn add(&mut self, moniker: QualifiedMoniker) -> bool {
        if self.seen.contains(&moniker) {
            return false;
        }
        self.seen.insert(moniker.clone());
        self.monikers.push(moniker);
        true
    }

    pub fn monikers(&self) -> &[QualifiedMoniker] {
        &self.monikers
    }

    pub fn into_monikers(self) -> Vec<QualifiedMoniker> {
        self.monikers
    }

    pub fn len(&self) -> usize {
        self.monikers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monikers.is_empty()
    }

    /// Distinct packages of the collected monikers, in a stable order.
    pub fn packages(&self) -> Vec<PackageInformation> {
        let packages: BTreeSet<&PackageInformation> =
            self.monikers.iter().map(|m| &m.package).collect();
        packages.into_iter().cloned().collect()
    }
}

pub fn qualify_symbol(symbol_name: &str) -> Result<QualifiedMoniker> {
    let malformed = |reason: String| CodeNavError::MalformedSymbol {
        symbol: symbol_name.to_string(),
        reason,
    };

    let parsed = parse_symbol(symbol_name).map_err(|err| malformed(format!("{err:?}")))?;
    if parsed.scheme.is_empty() {
        return Err(malformed("missing scheme".into()));
    }
    if parsed.descriptors.is_empty() {
        return Err(malformed("missing descriptors".into()));
    }

    let package = parsed
        .package
        .as_ref()
        .map(|package| PackageInformation {
            manager: empty_field(&package.manager),
            name: empty_field(&package.name),
            version: empty_field(&package.version),
        })
        .unwrap_or_default();

    Ok(QualifiedMoniker {
        moniker: Moniker {
            scheme: parsed.scheme,
            identifier: symbol_name.to_string(),
        },
        package,
    })
}

// `.` stands for an empty package field.
fn empty_field(value: &str) -> String {
    if value == "." {
        String::new()
    } else {
        value.to_string()
    }
}
