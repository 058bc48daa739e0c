//! The identity the auth provider says is signed in, as an observable
//! optional value. Reducers never see it directly: every action carries the
//! acting uid, and authorization happens inside the fold.

use std::cell::RefCell;

pub struct Session {
    current: RefCell<Option<String>>,
}

impl Session {
    pub fn new(uid: Option<String>) -> Self {
        Self {
            current: RefCell::new(uid),
        }
    }

    /// Returns true if the identity actually changed.
    pub fn set(&self, uid: Option<String>) -> bool {
        let mut current = self.current.borrow_mut();
        if *current == uid {
            false
        } else {
            *current = uid;
            true
        }
    }

    pub fn current(&self) -> Option<String> {
        self.current.borrow().clone()
    }
}
