// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::handle_posix_sigaction;
use crate::shared::configuration::CrashCatcherConfiguration;
use crate::shared::constants::ALT_STACK_MIN_PAGES;
use crate::signal_from_signum;
use libc::{
    c_int, c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE, SIGSTKSZ,
};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::{fmt, io, mem, ptr};
use thiserror::Error;
use tracing::{debug, warn};

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

// The chain table.  A slot is written by the installer only while its `CHAIN_READY` flag is
// false, and read by the crash handler only while it is true.
static mut HANDLERS: [Option<HandlerChainEntry>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static CHAIN_READY: [AtomicBool; MAX_SIGNALS] = [const { AtomicBool::new(false) }; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

type SigActionFn = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);
type HandlerFn = extern "C" fn(c_int);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Attempted to double register crash handlers")]
    AlreadyInstalled,
    #[error("{0} is not a signal that can be handled")]
    InvalidSignal(c_int),
    #[error("sigaction failed for signal {signum}: {source}")]
    Sigaction {
        signum: c_int,
        #[source]
        source: io::Error,
    },
    #[error("Failed to allocate an alternative stack: {0}")]
    AltStackAllocation(#[source] io::Error),
    #[error("Failed to set up alternative stack guard page: {0}")]
    AltStackGuard(#[source] io::Error),
    #[error("sigaltstack failed: {0}")]
    Sigaltstack(#[source] io::Error),
}

/// What a signal was handled by before the crash handler took over.
#[derive(Debug, Clone, Copy)]
pub enum PreviousHandler {
    /// `SIG_DFL`
    Default,
    /// `SIG_IGN`
    Ignore,
    /// A plain `sa_handler`.
    Handler(HandlerFn),
    /// A `SA_SIGINFO` handler.
    SigAction(SigActionFn),
}

/// The action a signal had before the crash handler displaced it.
#[derive(Clone, Copy)]
pub(crate) struct HandlerChainEntry {
    signum: c_int,
    action: libc::sigaction,
}

impl HandlerChainEntry {
    fn new(signum: c_int, mut action: libc::sigaction) -> Self {
        // Never chain to ourselves.
        if action.sa_sigaction == crash_handler_address() {
            action = default_action();
        }
        Self { signum, action }
    }

    pub fn disposition(&self) -> PreviousHandler {
        match self.action.sa_sigaction {
            libc::SIG_DFL => PreviousHandler::Default,
            libc::SIG_IGN => PreviousHandler::Ignore,
            // SAFETY: the kernel handed us this pointer as a handler of the matching kind.
            f if self.action.sa_flags & libc::SA_SIGINFO != 0 => {
                PreviousHandler::SigAction(unsafe { mem::transmute::<usize, SigActionFn>(f) })
            }
            f => PreviousHandler::Handler(unsafe { mem::transmute::<usize, HandlerFn>(f) }),
        }
    }

    /// Emulates `SA_RESETHAND` for a handler we call directly.
    ///
    /// SIGNAL SAFETY:
    ///     Only `sigaction`.
    unsafe fn reset_if_oneshot(&self) {
        if self.action.sa_flags & libc::SA_RESETHAND != 0 {
            let action = default_action();
            libc::sigaction(self.signum, &action, ptr::null_mut());
        }
    }

    fn same_action(&self, other: &libc::sigaction) -> bool {
        self.action.sa_sigaction == other.sa_sigaction && self.action.sa_flags == other.sa_flags
    }
}

impl fmt::Debug for HandlerChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChainEntry")
            .field("signum", &self.signum)
            .field("disposition", &self.disposition())
            .finish()
    }
}

/// Outcome of [`register_crash_handlers`].  Failures are per signal: a signal that could not be
/// registered keeps its previous disposition and the others are still covered.
#[derive(Debug, Default)]
pub(crate) struct RegistrationSummary {
    pub installed: Vec<c_int>,
    pub failed: Vec<(c_int, RegistrationError)>,
    pub alt_stack: bool,
}

fn crash_handler_address() -> libc::sighandler_t {
    handle_posix_sigaction as SigActionFn as libc::sighandler_t
}

fn default_action() -> libc::sigaction {
    // SAFETY: all-zero is a valid `sigaction`, and SIG_DFL is zero.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    // SAFETY: `sa_mask` is a valid sigset to initialize.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action
}

/// Registers UNIX signal handlers to detect program crashes.
/// This function uses a flag to ensure the initialization only happens once; later calls return
/// [`RegistrationError::AlreadyInstalled`].
/// PRECONDITIONS:
///     The configuration must already be stored for the crash handler (`update_config`).
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     Each signal's previous action is recorded in the chain table before the crash handler is
///     swapped in, so a fault at any point of this function is chained correctly.  Installing
///     handlers for the whole set is not atomic: a concurrent fault may find some signals not yet
///     covered.
pub(crate) fn register_crash_handlers(
    config: &CrashCatcherConfiguration,
) -> Result<RegistrationSummary, RegistrationError> {
    // Guarantee that the handlers is only mutated once.
    if INIT_STARTED
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        return Err(RegistrationError::AlreadyInstalled);
    }

    let mut summary = RegistrationSummary::default();

    if config.create_alt_stack() {
        // Safety: This function has no documented preconditions.
        match unsafe { create_alt_stack() } {
            Ok(()) => summary.alt_stack = true,
            Err(e) => warn!(
                error = %e,
                "Unable to create an alternative signal stack, stack overflows may go unreported"
            ),
        }
    }

    for &signum in config.signals() {
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(signum, config) } {
            Ok(()) => summary.installed.push(signum),
            Err(e) => {
                warn!(signum, error = %e, "Unable to register crash handler, signal keeps its previous disposition");
                summary.failed.push((signum, e));
            }
        }
    }
    INIT_FINISHED.store(true, SeqCst);
    Ok(summary)
}

/// True once [`register_crash_handlers`] has run to completion.
pub fn is_installed() -> bool {
    INIT_FINISHED.load(SeqCst)
}

pub(crate) fn is_init_started() -> bool {
    INIT_STARTED.load(SeqCst)
}

/// The action `signum` had before the crash handler was installed for it, if it was.
pub fn previous_handler(signum: c_int) -> Option<PreviousHandler> {
    chain_entry(signum).map(|entry| entry.disposition())
}

fn chain_entry(signum: c_int) -> Option<HandlerChainEntry> {
    if signum <= 0 || signum as usize >= MAX_SIGNALS {
        return None;
    }
    let index = signum as usize;
    if !CHAIN_READY[index].load(SeqCst) {
        return None;
    }
    // SAFETY: the slot is only written while its ready flag is false.
    unsafe { HANDLERS[index] }
}

/// # Safety
/// Only the installer may call this, see [`register_crash_handlers`].
unsafe fn store_chain_entry(entry: HandlerChainEntry) {
    let index = entry.signum as usize;
    CHAIN_READY[index].store(false, SeqCst);
    HANDLERS[index] = Some(entry);
    CHAIN_READY[index].store(true, SeqCst);
}

/// Once we've handled the signal, chain to any previous handlers.
///
/// - `SIG_DFL`: restore it and re-raise, so the process terminates with the same signal (and
///   core dump) it would have without us.
/// - `SIG_IGN`: for a fault, restore it and return, the kernel then forces the default action
///   on the retried instruction.  A signal sent by a process is simply dropped and the crash
///   handler stays installed.
/// - A handler: call it with the arguments we were called with.  If it was installed with
///   `SA_RESETHAND`, the kernel would have reset the disposition before running it, so we do too.
///
/// A signal with no chain entry (a fault racing the installer) is treated as `SIG_DFL`.
/// SIGNAL SAFETY:
///     Only `sigaction` and `raise`.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let Some(entry) = chain_entry(signum) else {
        restore_default_and_raise(signum);
        return;
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match entry.disposition() {
        PreviousHandler::Default => {
            if libc::sigaction(signum, &entry.action, ptr::null_mut()) != 0 {
                restore_default_and_raise(signum);
                return;
            }
            // Signals are only delivered once.
            // In the case where we were invoked because of a crash, returning
            // would re-invoke the crashing instruction and re-raise the signal.
            // In the case where we were invoked by `raise(SIGSEGV)` we need to
            // re-raise the signal, or the default handler will never receive it.
            // SA_NODEFER means the signal is not blocked here: this does not return.
            libc::raise(signum);
        }
        PreviousHandler::Ignore => {
            if !sig_info.is_null() && crate::is_user_sent((*sig_info).si_code) {
                return;
            }
            libc::sigaction(signum, &entry.action, ptr::null_mut());
        }
        PreviousHandler::Handler(f) => {
            entry.reset_if_oneshot();
            f(signum)
        }
        PreviousHandler::SigAction(f) => {
            entry.reset_if_oneshot();
            f(signum, sig_info, ucontext)
        }
    }
}

unsafe fn restore_default_and_raise(signum: c_int) {
    let action = default_action();
    libc::sigaction(signum, &action, ptr::null_mut());
    libc::raise(signum);
}

/// Gives the calling thread an alternate signal stack large enough for the crash handler.
///
/// Signal stacks are per thread: [`register_crash_handlers`] only covers the installing thread.
/// Threads that may overflow their stack should call this once.  The stack is never freed.
/// A thread that already has a large enough alternate stack keeps it.
pub fn install_alt_stack_for_current_thread() -> Result<(), RegistrationError> {
    // SAFETY: No preconditions.
    unsafe { create_alt_stack() }
}

fn alt_stack_size() -> usize {
    // The default SIGSTKSZ is 8KB, which the handler can exceed with its context and buffers on
    // the stack.
    std::cmp::max(SIGSTKSZ, ALT_STACK_MIN_PAGES * page_size::get())
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> Result<(), RegistrationError> {
    let sigaltstack_base_size = alt_stack_size();

    let mut current: libc::stack_t = mem::zeroed();
    if sigaltstack(ptr::null(), &mut current) == 0
        && current.ss_flags & libc::SS_DISABLE == 0
        && current.ss_size >= sigaltstack_base_size
    {
        debug!(
            size = current.ss_size,
            "Keeping the existing alternative signal stack"
        );
        return Ok(());
    }

    let page_size = page_size::get();
    let stackp = mmap(
        ptr::null_mut(),
        sigaltstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    if stackp == MAP_FAILED {
        return Err(RegistrationError::AltStackAllocation(
            io::Error::last_os_error(),
        ));
    }
    if libc::mprotect(stackp, page_size, PROT_NONE) != 0 {
        let err = io::Error::last_os_error();
        libc::munmap(stackp, sigaltstack_base_size + page_size);
        return Err(RegistrationError::AltStackGuard(err));
    }
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigaltstack_base_size,
    };
    if sigaltstack(&stack, ptr::null_mut()) != 0 {
        let err = io::Error::last_os_error();
        libc::munmap(stackp.sub(page_size), sigaltstack_base_size + page_size);
        return Err(RegistrationError::Sigaltstack(err));
    }
    debug!(size = sigaltstack_base_size, "Created alternative signal stack");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: c_int,
    config: &CrashCatcherConfiguration,
) -> Result<(), RegistrationError> {
    if signum <= 0 || signum as usize >= MAX_SIGNALS || signal_from_signum(signum).is_err() {
        return Err(RegistrationError::InvalidSignal(signum));
    }

    // Record the current action before anything else, so the crash handler can chain from the
    // moment it becomes active.
    let mut current: libc::sigaction = mem::zeroed();
    if libc::sigaction(signum, ptr::null(), &mut current) != 0 {
        return Err(RegistrationError::Sigaction {
            signum,
            source: io::Error::last_os_error(),
        });
    }
    let entry = HandlerChainEntry::new(signum, current);
    store_chain_entry(entry);

    // Between this and `create_alt_stack()`, there are a few things going on.
    // - It is generally preferable to run in an altstack, given the choice.
    // - Some runtimes set the altstack to a respectable size themselves, but check the value of
    //   the SP during their chained handler--in these cases, it is necessary to USE the altstack
    //   without creating it.
    // - There are no known cases where it is useful to create but not use the altstack--this
    //   case is rejected in `new()` for CrashCatcherConfiguration.
    let extra_saflags = if config.use_alt_stack() {
        libc::SA_ONSTACK
    } else {
        0
    };

    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = crash_handler_address();
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | extra_saflags;
    libc::sigemptyset(&mut action.sa_mask);

    let mut displaced: libc::sigaction = mem::zeroed();
    if libc::sigaction(signum, &action, &mut displaced) != 0 {
        CHAIN_READY[signum as usize].store(false, SeqCst);
        return Err(RegistrationError::Sigaction {
            signum,
            source: io::Error::last_os_error(),
        });
    }
    // Someone changed the action between our query and the swap.  The displaced one is what
    // the process would have run.
    if !entry.same_action(&displaced) {
        store_chain_entry(HandlerChainEntry::new(signum, displaced));
    }

    debug!(
        signum,
        previous = ?previous_handler(signum),
        "Registered crash handler"
    );
    Ok(())
}
