use std::fmt::{self, Display};
use std::time::Instant;

/// Describes the work every request performs: which exported function to call and with
/// which integer arguments.
///
/// The descriptor is fixed when the pool is configured and shared by reference with every
/// worker; individual [`Request`]s do not carry it.
///
/// # Example
///
/// ```
/// use invoke_bench::Call;
///
/// let call = Call::new("add", [77, 88]);
/// assert_eq!(call.function(), "add");
/// assert_eq!(call.args(), &[77, 88]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    function: Box<str>,
    args: Box<[i64]>,
}

impl Call {
    /// Creates a call descriptor for `function` with the given arguments.
    #[must_use]
    pub fn new(function: impl Into<Box<str>>, args: impl Into<Box<[i64]>>) -> Self {
        Self {
            function: function.into(),
            args: args.into(),
        }
    }

    /// Name of the exported function to call.
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Arguments passed on every call.
    #[must_use]
    pub fn args(&self) -> &[i64] {
        &self.args
    }
}

impl Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function)?;

        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }

            write!(f, "{arg}")?;
        }

        f.write_str(")")
    }
}

/// One unit of work flowing from the generator to a worker.
///
/// Requests are consumed exactly once. They carry no work descriptor, only what is needed to
/// account for them: a sequence number and the instant the generator issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    sequence: u64,
    issued_at: Instant,
}

impl Request {
    /// Creates a request issued now.
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self::issued_at(sequence, Instant::now())
    }

    /// Creates a request with an explicit issue instant.
    #[must_use]
    pub fn issued_at(sequence: u64, issued_at: Instant) -> Self {
        Self {
            sequence,
            issued_at,
        }
    }

    /// Position of this request in the generator's output, starting from zero.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the generator issued this request.
    #[must_use]
    pub fn issued(&self) -> Instant {
        self.issued_at
    }
}
