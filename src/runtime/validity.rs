//! Invalidation tokens for optimistic assumptions
//!
//! A [`ValidityCell`] guards a fact about the heap ("this prototype has not
//! been mutated", "this global still holds its first value"). Compiled code
//! that relies on the fact registers its [`CodeValidity`] with the cell;
//! invalidating the cell marks every dependent code object invalid, and
//! frames still running that code deoptimize at their next safepoint.

use crate::deopt::DeoptReason;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

struct CellInner {
    valid: Cell<bool>,
    dependents: RefCell<Vec<Weak<CodeValidityInner>>>,
}

/// A single-use invalidation token
#[derive(Clone)]
pub struct ValidityCell(Rc<CellInner>);

impl ValidityCell {
    pub fn new() -> Self {
        Self(Rc::new(CellInner {
            valid: Cell::new(true),
            dependents: RefCell::new(Vec::new()),
        }))
    }

    pub fn is_valid(&self) -> bool {
        self.0.valid.get()
    }

    /// Register code that must be invalidated with this cell.
    /// Returns false if the cell is already invalid.
    pub fn register(&self, code: &CodeValidity) -> bool {
        if !self.is_valid() {
            return false;
        }
        let mut dependents = self.0.dependents.borrow_mut();
        dependents.retain(|d| d.strong_count() > 0);
        dependents.push(Rc::downgrade(&code.0));
        true
    }

    /// Invalidate the cell and every code object depending on it.
    /// Returns the number of live dependents that were invalidated.
    pub fn invalidate(&self) -> usize {
        if !self.0.valid.replace(false) {
            return 0;
        }
        let dependents = std::mem::take(&mut *self.0.dependents.borrow_mut());
        let mut count = 0;
        for dependent in dependents {
            if let Some(code) = dependent.upgrade() {
                if CodeValidity(code).invalidate(DeoptReason::DependencyInvalidated) {
                    count += 1;
                }
            }
        }
        if count > 0 {
            tracing::debug!(count, "validity cell invalidated dependent code");
        }
        count
    }

    pub fn ptr_eq(&self, other: &ValidityCell) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for ValidityCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidityCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValidityCell({})", if self.is_valid() { "valid" } else { "invalid" })
    }
}

struct CodeValidityInner {
    invalidated: Cell<Option<DeoptReason>>,
}

/// Validity flag of one installed code object
#[derive(Clone)]
pub struct CodeValidity(Rc<CodeValidityInner>);

impl CodeValidity {
    pub fn new() -> Self {
        Self(Rc::new(CodeValidityInner {
            invalidated: Cell::new(None),
        }))
    }

    pub fn is_valid(&self) -> bool {
        self.0.invalidated.get().is_none()
    }

    /// Why the code was invalidated, if it was
    pub fn reason(&self) -> Option<DeoptReason> {
        self.0.invalidated.get()
    }

    /// Mark the code invalid; the first reason wins.
    /// Returns false if it was already invalid.
    pub fn invalidate(&self, reason: DeoptReason) -> bool {
        if self.0.invalidated.get().is_some() {
            return false;
        }
        self.0.invalidated.set(Some(reason));
        true
    }
}

impl Default for CodeValidity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_reaches_dependents() {
        let cell = ValidityCell::new();
        let code = CodeValidity::new();
        assert!(cell.register(&code));
        assert_eq!(cell.invalidate(), 1);
        assert!(!code.is_valid());
        assert_eq!(code.reason(), Some(DeoptReason::DependencyInvalidated));
        // single use
        assert_eq!(cell.invalidate(), 0);
        assert!(!cell.register(&CodeValidity::new()));
    }

    #[test]
    fn test_dropped_code_is_not_counted() {
        let cell = ValidityCell::new();
        {
            let code = CodeValidity::new();
            cell.register(&code);
        }
        assert_eq!(cell.invalidate(), 0);
    }

    #[test]
    fn test_first_reason_wins() {
        let code = CodeValidity::new();
        assert!(code.invalidate(DeoptReason::DebuggerAttached));
        assert!(!code.invalidate(DeoptReason::DependencyInvalidated));
        assert_eq!(code.reason(), Some(DeoptReason::DebuggerAttached));
    }
}
