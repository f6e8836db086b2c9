// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod api;
mod crash_context;
mod crash_handler;
mod emitters;
mod frame_pointer_walker;
mod platform;
mod signal_handler_manager;
mod signal_safe_writer;

pub use api::*;
pub use crash_handler::{disable, enable, CrashHandlerError};
pub use emitters::EmitterError;
pub use signal_handler_manager::{
    install_alt_stack_for_current_thread, is_installed, previous_handler, PreviousHandler,
    RegistrationError,
};
