//! Symbol patch engine.
//!
//! Rewrites symbol-pointer slots across loaded images so that calls bound to
//! one function land in another. Slots are found through the image walker;
//! the engine itself never does address arithmetic.

use crate::image::{Image, PointerTable};
use crate::symbols::Interposer;
use std::ffi::CString;
use std::ops::AddAssign;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Status code reported to callers that only want the outcome class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookResult {
    Success,
    NotFound,
    ProtectionFailed,
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("symbol not found: {0}")]
    NotFound(String),

    #[error("could not make {failures} matching slot(s) writable")]
    ProtectionFailed { failures: usize },
}

impl HookError {
    pub fn status(&self) -> HookResult {
        match self {
            HookError::InvalidArgument(_) => HookResult::InvalidArgument,
            HookError::NotFound(_) => HookResult::NotFound,
            HookError::ProtectionFailed { .. } => HookResult::ProtectionFailed,
        }
    }
}

/// What one rewrite pass did.
///
/// Zero replacements is a success: a target that no slot references and a
/// target that was already replaced look the same.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HookReport {
    pub replaced: usize,
    pub protection_failures: usize,
}

impl HookReport {
    pub fn status(&self) -> HookResult {
        if self.replaced == 0 && self.protection_failures > 0 {
            HookResult::ProtectionFailed
        } else {
            HookResult::Success
        }
    }
}

impl AddAssign for HookReport {
    fn add_assign(&mut self, other: Self) {
        self.replaced += other.replaced;
        self.protection_failures += other.protection_failures;
    }
}

/// Which images a rewrite applies to.
#[derive(Clone, Copy)]
pub enum HookScope<'a> {
    Image(&'a dyn Image),
    /// Every image the dynamic loader currently knows about.
    Global,
}

/// Supplies the images a global rewrite walks.
pub trait ImageSource: Send + Sync {
    fn images(&self) -> Vec<Box<dyn Image>>;
}

/// The images the dynamic loader has mapped into this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoaderImages;

impl ImageSource for LoaderImages {
    fn images(&self) -> Vec<Box<dyn Image>> {
        crate::sys::loaded_images()
    }
}

impl<F> ImageSource for F
where
    F: Fn() -> Vec<Box<dyn Image>> + Send + Sync,
{
    fn images(&self) -> Vec<Box<dyn Image>> {
        self()
    }
}

pub struct PatchEngine {
    source: Box<dyn ImageSource>,
}

impl PatchEngine {
    /// An engine whose global scope is every loaded image.
    pub fn loader() -> Self {
        Self::with_source(LoaderImages)
    }

    pub fn with_source(source: impl ImageSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Replace every slot in `scope` holding `target` with `replacement`.
    pub fn intercept(
        &self,
        scope: HookScope<'_>,
        target: usize,
        replacement: usize,
    ) -> Result<HookReport, HookError> {
        if target == 0 {
            return Err(HookError::InvalidArgument("null target"));
        }
        if replacement == 0 {
            return Err(HookError::InvalidArgument("null replacement"));
        }
        // Slots are written unsigned, the way the loader's own binds are
        // compared; signing for arm64e slots is not done.
        let target = strip_pac(target);
        let replacement = strip_pac(replacement);
        let mut report = HookReport::default();
        match scope {
            HookScope::Image(image) => report += rewrite_image(image, target, replacement),
            HookScope::Global => {
                for image in self.source.images() {
                    report += rewrite_image(image.as_ref(), target, replacement);
                }
            }
        }
        debug!(
            "intercept {target:#x} -> {replacement:#x}: {} replaced, {} protection failures",
            report.replaced, report.protection_failures
        );
        Ok(report)
    }

    /// Resolve `symbol` and redirect it globally to `replacement`.
    pub fn hook_symbol(&self, symbol: &str, replacement: usize) -> Result<HookReport, HookError> {
        let target = find_symbol(symbol).ok_or_else(|| HookError::NotFound(symbol.to_string()))?;
        let report = self.intercept(HookScope::Global, target, replacement)?;
        if report.status() == HookResult::ProtectionFailed {
            return Err(HookError::ProtectionFailed {
                failures: report.protection_failures,
            });
        }
        Ok(report)
    }

    /// Resolve and record the original of every interposer, then redirect
    /// each one globally. Symbols that do not resolve are left alone.
    pub fn install(&self, hooks: &[Interposer]) -> HookReport {
        let mut total = HookReport::default();
        for hook in hooks {
            let Some(original) = find_symbol(hook.symbol) else {
                warn!("{}: not resolvable, left unhooked", hook.symbol);
                continue;
            };
            hook.original.set(original);
            match self.intercept(HookScope::Global, original, hook.replacement.addr()) {
                Ok(report) => {
                    debug!("{}: {} slot(s) redirected", hook.symbol, report.replaced);
                    total += report;
                }
                Err(err) => warn!("{}: {err}", hook.symbol),
            }
        }
        total
    }
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::loader()
    }
}

fn rewrite_image(image: &dyn Image, target: usize, replacement: usize) -> HookReport {
    let mut report = HookReport::default();
    for table in image.pointer_tables() {
        rewrite_table(image.name(), &table, target, replacement, &mut report);
    }
    report
}

fn rewrite_table(
    image: &str,
    table: &PointerTable,
    target: usize,
    replacement: usize,
    report: &mut HookReport,
) {
    for index in 0..table.len() {
        let Some(value) = table.load(index) else { break };
        if strip_pac(value) != target {
            continue;
        }
        match table.store(index, replacement) {
            Ok(()) => {
                trace!(
                    "{image}: {}[{index}] {value:#x} -> {replacement:#x}",
                    table.section()
                );
                report.replaced += 1;
            }
            Err(err) => {
                warn!("{image}: {}[{index}] left unpatched: {err}", table.section());
                report.protection_failures += 1;
            }
        }
    }
}

/// Remove pointer-authentication bits from a code pointer.
#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
pub fn strip_pac(ptr: usize) -> usize {
    ptr & ((1 << 47) - 1)
}

#[cfg(not(all(target_arch = "aarch64", target_vendor = "apple")))]
pub fn strip_pac(ptr: usize) -> usize {
    ptr
}

/// Address of the exported function `name`, as the dynamic linker resolves it.
pub fn find_symbol(name: &str) -> Option<usize> {
    let name = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

pub fn loaded_images() -> Vec<Box<dyn Image>> {
    crate::sys::loaded_images()
}

pub fn main_image() -> Option<Box<dyn Image>> {
    crate::sys::main_image()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::image::testing::*;
    use std::sync::Arc;

    const TARGET: usize = 0x7000_1000;
    const OTHER: usize = 0x7000_2000;
    const HOOK: usize = 0x7000_3000;

    fn no_images() -> Vec<Box<dyn Image>> {
        Vec::new()
    }

    fn engine_over(synthetic: &Arc<SyntheticImage>) -> PatchEngine {
        let synthetic = synthetic.clone();
        PatchEngine::with_source(move || vec![Box::new(synthetic.image()) as Box<dyn Image>])
    }

    #[test]
    fn replaces_matching_slots_in_both_tables() {
        let synthetic = Arc::new(SyntheticImage::new(4));
        synthetic.fill(PAGE_GOT, &[OTHER, TARGET, OTHER, TARGET]);
        synthetic.fill(PAGE_LAZY, &[TARGET, OTHER]);
        synthetic.fill(PAGE_DATA, &[TARGET, TARGET]);

        let report = engine_over(&synthetic)
            .intercept(HookScope::Global, TARGET, HOOK)
            .unwrap();
        assert_eq!(report, HookReport { replaced: 3, protection_failures: 0 });
        assert_eq!(report.status(), HookResult::Success);

        assert_eq!(synthetic.slot(PAGE_GOT, 0), OTHER);
        assert_eq!(synthetic.slot(PAGE_GOT, 1), HOOK);
        assert_eq!(synthetic.slot(PAGE_GOT, 3), HOOK);
        assert_eq!(synthetic.slot(PAGE_LAZY, 0), HOOK);
        assert_eq!(synthetic.slot(PAGE_LAZY, 1), OTHER);
        // Plain data is never a symbol-pointer table.
        assert_eq!(synthetic.slot(PAGE_DATA, 0), TARGET);
    }

    #[test]
    fn rewriting_twice_is_idempotent() {
        let synthetic = Arc::new(SyntheticImage::new(2));
        synthetic.fill(PAGE_LAZY, &[TARGET, TARGET]);
        let engine = engine_over(&synthetic);

        let first = engine.intercept(HookScope::Global, TARGET, HOOK).unwrap();
        assert_eq!(first.replaced, 2);
        let second = engine.intercept(HookScope::Global, TARGET, HOOK).unwrap();
        assert_eq!(second, HookReport::default());
    }

    #[test]
    fn image_scope_touches_only_that_image() {
        let synthetic = Arc::new(SyntheticImage::new(1));
        synthetic.fill(PAGE_LAZY, &[TARGET]);
        let image = synthetic.image();
        let engine = PatchEngine::with_source(no_images);

        let global = engine.intercept(HookScope::Global, TARGET, HOOK).unwrap();
        assert_eq!(global.replaced, 0);
        assert_eq!(synthetic.slot(PAGE_LAZY, 0), TARGET);

        let scoped = engine.intercept(HookScope::Image(&image), TARGET, HOOK).unwrap();
        assert_eq!(scoped.replaced, 1);
        assert_eq!(synthetic.slot(PAGE_LAZY, 0), HOOK);
    }

    #[test]
    fn replacement_is_stored_in_the_same_encoding_as_matched_slots() {
        const TAG: usize = 0x002a << 48;
        let synthetic = Arc::new(SyntheticImage::new(1));
        synthetic.fill(PAGE_LAZY, &[strip_pac(TARGET | TAG)]);
        let engine = engine_over(&synthetic);

        let report = engine.intercept(HookScope::Global, TARGET | TAG, HOOK | TAG).unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(synthetic.slot(PAGE_LAZY, 0), strip_pac(HOOK | TAG));
    }

    #[test]
    fn null_arguments_are_rejected_before_scanning() {
        let synthetic = Arc::new(SyntheticImage::new(1));
        synthetic.fill(PAGE_LAZY, &[TARGET]);
        let engine = engine_over(&synthetic);

        let err = engine.intercept(HookScope::Global, 0, HOOK).unwrap_err();
        assert_eq!(err.status(), HookResult::InvalidArgument);
        let err = engine.intercept(HookScope::Global, TARGET, 0).unwrap_err();
        assert_eq!(err.status(), HookResult::InvalidArgument);
        assert_eq!(synthetic.slot(PAGE_LAZY, 0), TARGET);
    }

    #[test]
    fn unknown_symbol_is_not_found() {
        let engine = PatchEngine::with_source(no_images);
        let err = engine.hook_symbol("lodge_no_such_symbol", HOOK).unwrap_err();
        assert_eq!(err.status(), HookResult::NotFound);
    }

    #[test]
    fn resolves_libc_symbols() {
        assert!(find_symbol("getpid").is_some());
        assert!(find_symbol("lodge_no_such_symbol").is_none());
        assert!(find_symbol("bad\0name").is_none());
    }

    #[test]
    fn enumerates_loaded_images() {
        assert!(!loaded_images().is_empty());
        assert!(main_image().is_some());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn global_scope_redirects_got_entries() {
        extern "C" fn fake_getppid() -> libc::pid_t {
            -4242
        }

        let real = unsafe { libc::getppid() };
        let target = find_symbol("getppid").unwrap();
        let engine = PatchEngine::loader();
        let report = engine
            .intercept(HookScope::Global, target, fake_getppid as usize)
            .unwrap();
        assert!(report.replaced >= 1);
        assert_eq!(unsafe { libc::getppid() }, -4242);

        engine
            .intercept(HookScope::Global, fake_getppid as usize, target)
            .unwrap();
        assert_eq!(unsafe { libc::getppid() }, real);
    }
}
