use parking_lot::{Condvar, Mutex};

/// A one-shot signal the producer blocks on when its active buffer is full.
/// "One-shot" in the sense that each `wait` consumes exactly one `raise`;
/// it is not a latch that stays open.
pub struct Gate {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Gate {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    pub fn raise(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }
}
