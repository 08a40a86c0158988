/// Default name of the shared allocator segment.
pub const DEFAULT_SEGMENT_NAME: &str = "/protalloc";

/// Where the bin table lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateBacking {
  /// Ordinary process memory.
  #[default]
  Local,
  /// A named POSIX shared-memory segment other processes can attach to.
  ///
  /// No locking is provided: processes mutating the same table must
  /// serialize externally.
  Shared { name: String },
}

/// How a chunk's permission bits become page protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionPolicy {
  /// EXEC grants `R|W|X`, anything else grants `R|W`. Chunks share pages.
  #[default]
  ReadWriteFloor,
  /// READ is always granted, WRITE and EXEC only when requested. Chunks are
  /// rounded up to whole pages so each one owns its protection.
  ReadFloor,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocatorConfig {
  /// Backing of the bin table. Default: [`StateBacking::Local`].
  pub backing: StateBacking,

  /// Default: [`ProtectionPolicy::ReadWriteFloor`].
  pub policy: ProtectionPolicy,

  /// Chunks of at least this many bytes (header included) get their own
  /// anonymous mapping instead of growing the heap. Default: disabled.
  pub mmap_threshold: Option<usize>,
}

impl AllocatorConfig {
  /// Config with the bin table in the shared segment `name`.
  pub fn shared(name: impl Into<String>) -> Self {
    Self {
      backing: StateBacking::Shared { name: name.into() },
      ..Self::default()
    }
  }

  pub fn with_policy(
    mut self,
    policy: ProtectionPolicy,
  ) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_mmap_threshold(
    mut self,
    threshold: usize,
  ) -> Self {
    self.mmap_threshold = Some(threshold);
    self
  }
}
