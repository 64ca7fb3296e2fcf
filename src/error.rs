use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `rtld` library.
/// These errors represent the failure conditions that can occur while
/// loading, parsing, relocating and linking ELF objects.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while opening or reading an ELF file.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// An error occurred during a memory mapping operation.
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while relocating a loaded object.
    Relocation {
        /// A descriptive message about the relocation error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while parsing the `.dynamic` section.
    ParseDynamic {
        /// A descriptive message about the dynamic section parsing error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while parsing the ELF header.
    ParseEhdr {
        /// A descriptive message about the ELF header parsing error.
        msg: Cow<'static, str>,
    },

    /// A symbol could not be found.
    FindSymbol {
        /// A descriptive message about the failed lookup.
        msg: Cow<'static, str>,
    },

    /// The object registry cannot accept another entry.
    Registry {
        /// A descriptive message about the registry error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::Relocation { msg } => write!(f, "Relocation error: {msg}"),
            Error::ParseDynamic { msg } => write!(f, "Dynamic section parsing error: {msg}"),
            Error::ParseEhdr { msg } => write!(f, "ELF header parsing error: {msg}"),
            Error::FindSymbol { msg } => write!(f, "Symbol lookup error: {msg}"),
            Error::Registry { msg } => write!(f, "Registry error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_dynamic_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseDynamic { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_ehdr_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseEhdr { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn find_symbol_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::FindSymbol { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn registry_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Registry { msg: msg.into() }
}
