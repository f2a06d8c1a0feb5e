use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether the OS has granted the sensors a cycle needs.
/// Prompting the user is somebody else's job.
pub trait PermissionGate: Send + Sync {
    fn microphone_granted(&self) -> bool;
    fn motion_granted(&self) -> bool;
}

/// Grants held in memory, flipped by whoever observes the OS prompts.
#[derive(Debug)]
pub struct StaticPermissions {
    microphone: AtomicBool,
    motion: AtomicBool,
}

impl StaticPermissions {
    pub fn new(microphone: bool, motion: bool) -> Self {
        Self {
            microphone: AtomicBool::new(microphone),
            motion: AtomicBool::new(motion),
        }
    }

    pub fn granted() -> Self {
        Self::new(true, true)
    }

    pub fn set_microphone(&self, granted: bool) {
        self.microphone.store(granted, Ordering::SeqCst);
    }

    pub fn set_motion(&self, granted: bool) {
        self.motion.store(granted, Ordering::SeqCst);
    }
}

impl PermissionGate for StaticPermissions {
    fn microphone_granted(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }

    fn motion_granted(&self) -> bool {
        self.motion.load(Ordering::SeqCst)
    }
}
