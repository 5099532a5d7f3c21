//! Domain scope routing.
//!
//! A service invocation declares which sheets it is filling. Writes outside
//! that declaration, or outside the strict field allowlist when one is
//! configured, are rejected rather than silently widened.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tavern_core::error::DomainError;
use tavern_core::service::FillTask;
use tavern_core::sheet::SheetId;

/// Sheets an invocation declared it will write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredScope {
    /// Sheets the invocation is expected to write.
    pub required_sheets: Vec<SheetId>,
    /// Single-sheet constraint of a fan-out request.
    pub target_sheet: Option<SheetId>,
}

impl DeclaredScope {
    /// Reads the scope from a fill task, if the invocation carried one.
    #[must_use]
    pub fn from_task(task: Option<&FillTask>) -> Self {
        task.map_or_else(Self::default, |task| Self {
            required_sheets: task.required_sheets.clone(),
            target_sheet: task.target_sheet.clone(),
        })
    }

    /// Whether nothing was declared.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.target_sheet.is_none() && self.required_sheets.is_empty()
    }

    /// Whether the declaration covers a sheet. Open scopes cover every sheet.
    #[must_use]
    pub fn covers(&self, sheet: &SheetId) -> bool {
        if let Some(target) = &self.target_sheet {
            return target == sheet;
        }
        self.required_sheets.is_empty() || self.required_sheets.contains(sheet)
    }
}

/// Strict allowlist: domain → sheet → writable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrictAllowlist(pub BTreeMap<String, BTreeMap<String, Vec<String>>>);

impl StrictAllowlist {
    /// Fields writable on a sheet, merged across domains. `None` when no
    /// domain lists the sheet.
    #[must_use]
    pub fn fields_for(&self, sheet: &SheetId) -> Option<BTreeSet<&str>> {
        let mut found = false;
        let mut fields = BTreeSet::new();
        for sheets in self.0.values() {
            if let Some(listed) = sheets.get(sheet.as_str()) {
                found = true;
                fields.extend(listed.iter().map(|f| f.trim()).filter(|f| !f.is_empty()));
            }
        }
        found.then_some(fields)
    }

    /// Whether any of the field names is listed for the sheet.
    #[must_use]
    pub fn has_any_field(&self, sheet: &SheetId, names: &[&str]) -> bool {
        self.fields_for(sheet)
            .is_some_and(|fields| names.iter().any(|name| fields.contains(name)))
    }
}

/// Decides which sheet/field writes a batch may perform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopePolicy {
    declared: DeclaredScope,
    allowlist: Option<StrictAllowlist>,
}

impl ScopePolicy {
    /// Builds a policy. Pass an allowlist only when strict mode is on.
    #[must_use]
    pub fn new(declared: DeclaredScope, allowlist: Option<StrictAllowlist>) -> Self {
        Self {
            declared,
            allowlist,
        }
    }

    /// A policy allowing every write.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// The declared scope.
    #[must_use]
    pub fn declared(&self) -> &DeclaredScope {
        &self.declared
    }

    /// The strict allowlist, when strict mode is on.
    #[must_use]
    pub fn allowlist(&self) -> Option<&StrictAllowlist> {
        self.allowlist.as_ref()
    }

    /// Whether a write to `sheet` (and `field`, if given) is allowed.
    #[must_use]
    pub fn is_allowed(&self, sheet: &SheetId, field: Option<&str>) -> bool {
        if !self.declared.covers(sheet) {
            return false;
        }
        let Some(allowlist) = &self.allowlist else {
            return true;
        };
        match allowlist.fields_for(sheet) {
            None => false,
            Some(fields) => field.is_none_or(|f| fields.contains(f)),
        }
    }

    /// Checks a write.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::OutOfScopeWrite` when the write is not allowed.
    pub fn check(&self, sheet: &SheetId, field: Option<&str>) -> Result<(), DomainError> {
        if self.is_allowed(sheet, field) {
            Ok(())
        } else {
            Err(DomainError::OutOfScopeWrite {
                sheet: sheet.as_str().to_owned(),
                field: field.map(str::to_owned),
            })
        }
    }

    /// Checks a currency movement. The declaration must cover the ledger
    /// and, in strict mode, the allowlist must expose the purse or the
    /// ledger.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::OutOfScopeWrite` on `ECON_Ledger` when money
    /// may not move.
    pub fn check_economy(&self) -> Result<(), DomainError> {
        let listed = self.allowlist.as_ref().is_none_or(|list| {
            list.has_any_field(&SheetId::CharacterResources, &["currency", "法利"])
                || list.fields_for(&SheetId::EconLedger).is_some()
        });
        if self.declared.covers(&SheetId::EconLedger) && listed {
            Ok(())
        } else {
            Err(DomainError::OutOfScopeWrite {
                sheet: SheetId::EconLedger.as_str().to_owned(),
                field: None,
            })
        }
    }
}
