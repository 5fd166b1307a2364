//! Build Context Assembler
//!
//! Transforms a set of generated source files plus a resource descriptor
//! into a self-contained, buildable container context: the creator wallet
//! placeholder is substituted, missing support files are synthesized,
//! cross-cutting handlers are injected into the main file, and a build
//! recipe is generated. User-supplied build recipes are always discarded.

pub mod archive;
pub mod assembler;
pub mod injection;
pub mod templates;

pub use assembler::{
    context_size, AssembleError, AssemblerConfig, BuildContext, BuildContextAssembler,
    DEFAULT_MAX_CONTEXT_BYTES, WALLET_PLACEHOLDER,
};
pub use injection::{apply_injections, default_injections, Anchor, Injection, InjectionContext};
