use std::sync::atomic::{AtomicBool, Ordering};

/// Pipeline-wide shutdown flag. A failing worker sets it; the controller
/// then marks every queue ignore-rest so the stages drain cleanly.
#[derive(Default)]
pub struct Cancel {
    flag: AtomicBool,
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel {
            flag: AtomicBool::new(false),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
