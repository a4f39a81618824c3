//! Keyboard input boundary.
//!
//! The external keyboard ISR pushes decoded bytes with [`push_char`];
//! the getchar/kbhit syscalls drain the ring buffer. The buffer drops
//! the oldest byte on overflow — type-ahead, not backpressure.

use spin::Mutex;

const QUEUE_SIZE: usize = 256;

struct Ring {
    buf: [u8; QUEUE_SIZE],
    head: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            buf: [0; QUEUE_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, b: u8) {
        if self.len == QUEUE_SIZE {
            self.head = (self.head + 1) % QUEUE_SIZE;
            self.len -= 1;
        }
        self.buf[(self.head + self.len) % QUEUE_SIZE] = b;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % QUEUE_SIZE;
        self.len -= 1;
        Some(b)
    }
}

static QUEUE: Mutex<Ring> = Mutex::new(Ring::new());

/// Called by the keyboard ISR with a decoded byte.
pub fn push_char(b: u8) {
    QUEUE.lock().push(b);
}

/// Non-blocking read.
pub fn poll() -> Option<u8> {
    QUEUE.lock().pop()
}

/// Is a byte waiting?
pub fn has_input() -> bool {
    QUEUE.lock().len > 0
}

/// Blocking read: sleep through interrupts until the ISR feeds a byte.
/// On the host this degrades to a single poll so tests cannot hang.
pub fn getchar_blocking() -> u8 {
    loop {
        if let Some(b) = poll() {
            return b;
        }
        #[cfg(not(target_os = "none"))]
        return 0;
        #[cfg(target_os = "none")]
        crate::arch::x86::interrupts::enable_and_halt();
    }
}
