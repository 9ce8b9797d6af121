use crate::{
    CompiledKernel, ComputeDevice, KernelBody, KernelBuildError, KernelProgram, Precision, RVec,
};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Options passed to the kernel compiler alongside the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompilerOption {
    FastRelaxedMath,
    Fp16Arithmetic,
    DisableOptimizations,
}

impl CompilerOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompilerOption::FastRelaxedMath => "fast_relaxed_math",
            CompilerOption::Fp16Arithmetic => "fp16",
            CompilerOption::DisableOptimizations => "opt_disable",
        }
    }
}

/// Human readable kernel identifier: the operation name followed by a digest
/// of the source text and compiler options.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelKey(String);

impl KernelKey {
    pub fn new(stem: &str, source: &str, options: &[CompilerOption]) -> Self {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        options.hash(&mut hasher);
        Self(format!("{stem}_{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generated kernel source.
///
/// `text` is what a shader compiler consumes. The structured `body` and the
/// launch conventions travel with it for backends that interpret kernels
/// instead of compiling them.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub text: String,
    pub body: KernelBody,
    pub precision: Precision,
    /// Destination tensor whose extent defines the launch grid.
    pub grid_tensor: String,
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    text: String,
    options: RVec<CompilerOption>,
}

/// Build-and-reuse cache of kernels, keyed by source text and compiler
/// options.
///
/// Shared between operations; identical sources are built once.
#[derive(Default)]
pub struct ProgramCache {
    programs: RwLock<HashMap<ProgramKey, CompiledKernel>>,
    builds: AtomicUsize,
}

impl std::fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramCache")
            .field("programs", &self.len())
            .field("builds", &self.builds())
            .finish()
    }
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        stem: &str,
        source: KernelSource,
        options: &[CompilerOption],
        device: &dyn ComputeDevice,
    ) -> Result<CompiledKernel, KernelBuildError> {
        let mut options: RVec<CompilerOption> = options.iter().copied().collect();
        options.sort();
        options.dedup();

        let program_key = ProgramKey {
            text: source.text.clone(),
            options,
        };

        if let Some(kernel) = self.programs.read().get(&program_key) {
            log::trace!("Reusing kernel {}", kernel.key());
            return Ok(kernel.clone());
        }

        let mut programs = self.programs.write();
        if let Some(kernel) = programs.get(&program_key) {
            return Ok(kernel.clone());
        }

        let key = KernelKey::new(stem, &program_key.text, &program_key.options);
        log::debug!("Building kernel {key} on {}", device.name());
        let program = Arc::new(KernelProgram {
            key,
            source,
            options: program_key.options.clone(),
        });
        let native = device.build_kernel(&program)?;
        let kernel = CompiledKernel::new(program, native);
        self.builds.fetch_add(1, Ordering::Relaxed);
        programs.insert(program_key, kernel.clone());
        Ok(kernel)
    }

    /// Number of distinct kernels held.
    pub fn len(&self) -> usize {
        self.programs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times the device was asked to build a kernel.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.programs.write().clear();
    }
}
