//! Kernels compiled into the harness itself, callable by name like program exports.

use crate::{Call, CallError, Executable, ExecutionFault, InvocationError};

/// Size of the linear memory given to each instance by [`NativeProgram::with_memory()`].
pub const NATIVE_MEMORY_BYTES: usize = 64 * 1024;

/// Elements in each vector of the `add_vec` kernel.
pub const VECTOR_LEN: usize = 4096;

const I32_BYTES: usize = 4;

/// Ahead-of-time compiled kernels exposed through the [`Executable`] capability.
///
/// Exports:
///
/// * `add(a, b)`: 32-bit wrapping addition.
/// * `add_mem(a, b)`: stores both operands into linear memory, loads them back and adds them,
///   paying for two bounds-checked stores and two bounds-checked loads.
/// * `load(addr)`: reads a little-endian 32-bit integer from linear memory.
/// * `bump()`: increments a per-instance counter and returns the new value.
/// * `add_vec(x, y)`: fills two [`VECTOR_LEN`]-element vectors with `x` and `y`, adds them
///   element-wise into a third and returns its first element.
/// * `matmul64(a, b)`, `matmul128(a, b)`: fills two square matrices with `a` and `b`, multiplies
///   them into a third and returns the wrapping sum of its elements.
///
/// [`memory_needed()`][Self::memory_needed] tells how much linear memory each kernel uses.
///
/// Memory accesses are always bounds-checked; an access outside linear memory (including any
/// access when the program was created without memory) is an [`ExecutionFault`].
///
/// # Example
///
/// ```
/// use invoke_bench::{Call, Executable, NativeProgram};
///
/// let program = NativeProgram::new();
/// let mut instance = program.instantiate()?;
///
/// let sum = program.invoke(&mut instance, &Call::new("add", [77, 88]))?;
/// assert_eq!(sum, 165);
/// # Ok::<(), invoke_bench::CallError>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct NativeProgram {
    memory_bytes: usize,
}

impl NativeProgram {
    /// Creates a program whose instances have no linear memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a program whose instances each own [`NATIVE_MEMORY_BYTES`] of zeroed memory.
    #[must_use]
    pub fn with_memory() -> Self {
        Self {
            memory_bytes: NATIVE_MEMORY_BYTES,
        }
    }

    /// Creates a program whose instances each own `memory_bytes` of zeroed memory.
    #[must_use]
    pub fn with_memory_bytes(memory_bytes: usize) -> Self {
        Self { memory_bytes }
    }

    /// Size of the linear memory of each instance, in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// Linear memory the kernel `function` touches, in bytes, or `None` if there is no such
    /// kernel.
    ///
    /// `load` reads wherever it is told to, so it needs no memory of its own.
    ///
    /// # Example
    ///
    /// ```
    /// use invoke_bench::NativeProgram;
    ///
    /// assert_eq!(NativeProgram::memory_needed("add"), Some(0));
    /// assert_eq!(NativeProgram::memory_needed("matmul64"), Some(3 * 64 * 64 * 4));
    /// assert_eq!(NativeProgram::memory_needed("mul"), None);
    /// ```
    #[must_use]
    pub fn memory_needed(function: &str) -> Option<usize> {
        match function {
            "add" | "load" | "bump" => Some(0),
            "add_mem" => Some(2 * I32_BYTES),
            "add_vec" => Some(3 * VECTOR_LEN * I32_BYTES),
            "matmul64" => Some(3 * 64 * 64 * I32_BYTES),
            "matmul128" => Some(3 * 128 * 128 * I32_BYTES),
            _ => None,
        }
    }
}

/// Address of the `index`-th 32-bit slot of the array starting at `base`.
///
/// Addresses that wrap around end up out of bounds and fault like any other.
fn slot(base: usize, index: usize) -> usize {
    base.wrapping_add(index.wrapping_mul(I32_BYTES))
}

/// Execution context of a [`NativeProgram`].
#[derive(Debug)]
pub struct NativeInstance {
    memory: Box<[u8]>,
    counter: i64,
}

impl NativeInstance {
    fn store_i32(&mut self, address: usize, value: i32) -> Result<(), ExecutionFault> {
        let memory_len = self.memory.len();

        let slot = address
            .checked_add(I32_BYTES)
            .and_then(|end| self.memory.get_mut(address..end))
            .ok_or_else(|| out_of_bounds(address, memory_len))?;

        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn load_i32(&self, address: usize) -> Result<i32, ExecutionFault> {
        let slot = address
            .checked_add(I32_BYTES)
            .and_then(|end| self.memory.get(address..end))
            .ok_or_else(|| out_of_bounds(address, self.memory.len()))?;

        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(slot);
        Ok(i32::from_le_bytes(bytes))
    }

    fn fill_i32(&mut self, base: usize, count: usize, value: i32) -> Result<(), ExecutionFault> {
        for index in 0..count {
            self.store_i32(slot(base, index), value)?;
        }

        Ok(())
    }

    fn add_vec(&mut self, x: i32, y: i32) -> Result<i32, ExecutionFault> {
        let lhs = 0;
        let rhs = slot(lhs, VECTOR_LEN);
        let sum = slot(rhs, VECTOR_LEN);

        self.fill_i32(lhs, VECTOR_LEN, x)?;
        self.fill_i32(rhs, VECTOR_LEN, y)?;

        for index in 0..VECTOR_LEN {
            let value = self
                .load_i32(slot(lhs, index))?
                .wrapping_add(self.load_i32(slot(rhs, index))?);
            self.store_i32(slot(sum, index), value)?;
        }

        self.load_i32(sum)
    }

    /// Row-major `dimension` x `dimension` matrices laid out back to back from address 0.
    fn matmul(&mut self, dimension: usize, a: i32, b: i32) -> Result<i32, ExecutionFault> {
        let cells = dimension.wrapping_mul(dimension);
        let lhs = 0;
        let rhs = slot(lhs, cells);
        let product = slot(rhs, cells);

        self.fill_i32(lhs, cells, a)?;
        self.fill_i32(rhs, cells, b)?;

        for row in 0..dimension {
            let row_start = row.wrapping_mul(dimension);

            for column in 0..dimension {
                let mut value: i32 = 0;

                for k in 0..dimension {
                    let left = self.load_i32(slot(lhs, row_start.wrapping_add(k)))?;
                    let right =
                        self.load_i32(slot(rhs, k.wrapping_mul(dimension).wrapping_add(column)))?;
                    value = value.wrapping_add(left.wrapping_mul(right));
                }

                self.store_i32(slot(product, row_start.wrapping_add(column)), value)?;
            }
        }

        let mut total: i32 = 0;

        for cell in 0..cells {
            total = total.wrapping_add(self.load_i32(slot(product, cell))?);
        }

        Ok(total)
    }
}

fn out_of_bounds(address: usize, memory_len: usize) -> ExecutionFault {
    ExecutionFault::new(format!(
        "out of bounds memory access: 4 bytes at address {address} in a {memory_len}-byte memory"
    ))
}

impl Executable for NativeProgram {
    type Instance = NativeInstance;

    fn instantiate(&self) -> Result<NativeInstance, CallError> {
        Ok(NativeInstance {
            memory: vec![0; self.memory_bytes].into_boxed_slice(),
            counter: 0,
        })
    }

    fn reinstantiate(&self, instance: &mut NativeInstance) -> Result<(), CallError> {
        instance.memory.fill(0);
        instance.counter = 0;
        Ok(())
    }

    fn invoke(&self, instance: &mut NativeInstance, call: &Call) -> Result<i64, CallError> {
        let function = call.function();

        match function {
            "add" => {
                let [a, b] = i32_args::<2>(call)?;
                Ok(i64::from(a.wrapping_add(b)))
            }
            "add_mem" => {
                let [a, b] = i32_args::<2>(call)?;
                instance.store_i32(0, a)?;
                instance.store_i32(4, b)?;
                let sum = instance.load_i32(0)?.wrapping_add(instance.load_i32(4)?);
                Ok(i64::from(sum))
            }
            "load" => {
                let [address] = i32_args::<1>(call)?;
                // Addresses are unsigned 32-bit offsets, as in WebAssembly linear memory.
                #[expect(clippy::cast_sign_loss, reason = "reinterpreting as an unsigned offset")]
                let address = address as u32 as usize;
                Ok(i64::from(instance.load_i32(address)?))
            }
            "add_vec" => {
                let [x, y] = i32_args::<2>(call)?;
                Ok(i64::from(instance.add_vec(x, y)?))
            }
            "matmul64" => {
                let [a, b] = i32_args::<2>(call)?;
                Ok(i64::from(instance.matmul(64, a, b)?))
            }
            "matmul128" => {
                let [a, b] = i32_args::<2>(call)?;
                Ok(i64::from(instance.matmul(128, a, b)?))
            }
            "bump" => {
                let [] = i32_args::<0>(call)?;
                instance.counter = instance.counter.wrapping_add(1);
                Ok(instance.counter)
            }
            _ => Err(InvocationError::MissingExport {
                function: function.to_string(),
            }
            .into()),
        }
    }
}

/// Converts the arguments of `call` into exactly `N` 32-bit parameters.
fn i32_args<const N: usize>(call: &Call) -> Result<[i32; N], InvocationError> {
    let args = call.args();

    if args.len() != N {
        return Err(InvocationError::ArityMismatch {
            function: call.function().to_string(),
            expected: N,
            actual: args.len(),
        });
    }

    let mut converted = [0_i32; N];

    for (index, (slot, &value)) in converted.iter_mut().zip(args).enumerate() {
        let Ok(narrowed) = i32::try_from(value) else {
            return Err(InvocationError::ArgumentOutOfRange {
                function: call.function().to_string(),
                index,
                value,
            });
        };

        *slot = narrowed;
    }

    Ok(converted)
}
