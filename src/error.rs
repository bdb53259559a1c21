use thiserror::Error;

/// Error type shared by every structure in the crate. One variant per
/// failure class so callers can match on capacity errors (`BTreeNodeFull`,
/// `HeapFull`) without string comparisons.
#[derive(Error, Debug)]
pub enum Hdf5Error {
    #[error("bad signature at {address:#x}: expected {expected:?}, found {found:02x?}")]
    BadSignature {
        expected: [u8; 4],
        found: [u8; 4],
        address: u64,
    },

    #[error("unsupported {what} version {found}")]
    UnsupportedVersion { what: &'static str, found: u8 },

    #[error("only single-leaf B-trees are supported (depth {depth})")]
    UnsupportedDepth { depth: u16 },

    #[error("checksum mismatch at {address:#x}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        address: u64,
        stored: u32,
        computed: u32,
    },

    #[error("v1 B-tree node type mismatch: expected {expected}, found {found}")]
    NodeTypeMismatch { expected: u8, found: u8 },

    #[error("B-tree node is full")]
    BTreeNodeFull,

    #[error("heap is full")]
    HeapFull,

    #[error("symbol table node is full")]
    SnodFull,

    #[error("local heap is full")]
    LocalHeapFull,

    #[error("offset beyond heap data")]
    OffsetBeyondHeap,

    #[error("string not null-terminated")]
    UnterminatedString,

    #[error("indirect block entry {index} out of range (capacity {capacity})")]
    EntryOutOfRange { index: usize, capacity: usize },

    #[error("{0}")]
    InvalidInput(String),

    #[error("object of {size} bytes exceeds maximum managed size of {max} bytes")]
    ObjectTooLarge { size: usize, max: usize },

    #[error("cannot insert an empty object")]
    EmptyObject,

    #[error("object not found in heap")]
    ObjectNotFound,

    #[error("record not found: {name}")]
    RecordNotFound { name: String },

    #[error("invalid heap object id: {reason}")]
    InvalidObjectId { reason: &'static str },

    #[error("unsupported filter {id}")]
    UnsupportedFilter { id: u16 },

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Operation context wrapped around an underlying failure. The source
    /// chain stays reachable through `std::error::Error::source`.
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Hdf5Error>,
    },
}

pub type Result<T> = std::result::Result<T, Hdf5Error>;

impl Hdf5Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Hdf5Error::InvalidInput(msg.into())
    }

    /// Strip any context layers and return the root failure.
    pub fn root_cause(&self) -> &Hdf5Error {
        let mut err = self;
        while let Hdf5Error::Context { source, .. } = err {
            err = source;
        }
        err
    }
}

/// `anyhow`-style context attachment for crate results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Hdf5Error::Context {
            context: context.into(),
            source: Box::new(e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Hdf5Error::Context {
            context: f(),
            source: Box::new(e),
        })
    }
}
