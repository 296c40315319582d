//! Captured call stacks.

use std::fmt;

/// Upper bound on captured frames, matching the platform stack walker.
pub const MAX_STACK_DEPTH: usize = 62;

/// Load-address-independent identity of a call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId(pub u64);

impl StackId {
    /// Wrap a raw identity.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identity.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Parse a hex identity, with or without a `0x` prefix.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        u64::from_str_radix(digits, 16).ok().map(Self)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A captured call chain.
#[derive(Debug, Clone)]
pub struct StackCapture {
    /// Absolute return addresses, innermost first.
    frames: Vec<usize>,
    /// The same addresses as offsets into their modules (absolute when the
    /// module is unknown).
    relative_frames: Vec<usize>,
    stack_id: StackId,
}

impl StackCapture {
    /// Capture the calling thread's stack.
    ///
    /// `skip` frames above the caller are dropped; at most `max_depth`
    /// frames (clamped to [`MAX_STACK_DEPTH`]) are kept.
    #[inline(never)]
    pub fn capture(skip: usize, max_depth: usize) -> Self {
        let max_depth = max_depth.min(MAX_STACK_DEPTH);
        let mut frames = Vec::with_capacity(max_depth);
        let mut relative_frames = Vec::with_capacity(max_depth);
        if max_depth == 0 {
            return Self::from_parts(frames, relative_frames);
        }

        // Our own frame is always skipped.
        let mut to_skip = skip + 1;
        backtrace::trace(|frame| {
            if to_skip > 0 {
                to_skip -= 1;
                return true;
            }
            let ip = frame.ip() as usize;
            if ip == 0 {
                return false;
            }
            let base = frame
                .module_base_address()
                .map(|base| base as usize)
                .or_else(|| module_base(ip));
            frames.push(ip);
            relative_frames.push(base.map_or(ip, |base| ip.wrapping_sub(base)));
            frames.len() < max_depth
        });

        Self::from_parts(frames, relative_frames)
    }

    /// Build a capture from known return addresses.
    pub fn from_frames(frames: &[usize]) -> Self {
        let frames: Vec<usize> = frames.iter().copied().take(MAX_STACK_DEPTH).collect();
        let relative_frames = frames
            .iter()
            .map(|&ip| module_base(ip).map_or(ip, |base| ip.wrapping_sub(base)))
            .collect();
        Self::from_parts(frames, relative_frames)
    }

    fn from_parts(frames: Vec<usize>, relative_frames: Vec<usize>) -> Self {
        let stack_id = Self::relative_id_of(&relative_frames);
        Self {
            frames,
            relative_frames,
            stack_id,
        }
    }

    /// FNV-1a over the module-relative frames.
    fn relative_id_of(relative_frames: &[usize]) -> StackId {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET_BASIS;
        for &offset in relative_frames {
            for byte in (offset as u64).to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(PRIME);
            }
        }
        StackId(hash)
    }

    /// Recompute the identity from the module-relative frames.
    pub fn relative_id(&self) -> StackId {
        Self::relative_id_of(&self.relative_frames)
    }

    /// The identity computed at capture time.
    pub fn stack_id(&self) -> StackId {
        self.stack_id
    }

    /// Absolute return addresses, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Module-relative offsets, innermost first.
    pub fn relative_frames(&self) -> &[usize] {
        &self.relative_frames
    }

    /// Number of captured frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was captured.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stack {}:", self.stack_id)?;
        for (i, (ip, rel)) in self.frames.iter().zip(&self.relative_frames).enumerate() {
            writeln!(f, "  #{:<2} {:#x} (+{:#x})", i, ip, rel)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn module_base(ip: usize) -> Option<usize> {
    // SAFETY: Dl_info is plain data; all-zero is a valid empty value.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only consults the loader's tables and fills `info`.
    let found = unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) };
    (found != 0 && !info.dli_fbase.is_null()).then(|| info.dli_fbase as usize)
}

#[cfg(not(unix))]
fn module_base(_ip: usize) -> Option<usize> {
    None
}
