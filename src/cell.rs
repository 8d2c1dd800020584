use std::cell::UnsafeCell;

// Interior mutability without synchronization, for state that is only ever
// touched from the audio thread while callbacks run and from the setup
// thread while they do not.
#[derive(Debug, Default)]
pub struct RtCell<T> {
    data: UnsafeCell<T>,
}

impl<T> RtCell<T> {
    pub fn new(data: T) -> Self {
        RtCell {
            data: UnsafeCell::new(data),
        }
    }

    // "Locks" the cell and returns a mutable reference to the data.
    // There is no actual locking; the caller guarantees exclusive access,
    // which holds on the realtime path because the server invokes the
    // process callback from a single thread, and on the setup path because
    // callbacks are stopped between activate and deactivate.
    #[allow(clippy::mut_from_ref)]
    pub fn lock(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

unsafe impl<T: Send> Send for RtCell<T> {}
unsafe impl<T: Send> Sync for RtCell<T> {}
