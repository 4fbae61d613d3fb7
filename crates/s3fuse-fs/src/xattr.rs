//! User extended attributes as stored on objects.

/// Per-entry capability flags.
///
/// User attributes get all of them; the reserved read-only entries that
/// surface object fields are visible and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrFlags {
    /// Value may be changed through the xattr interface.
    pub writable: bool,
    /// Serialised onto the wire as a metadata header.
    pub serializable: bool,
    /// Listed by `listxattr`.
    pub visible: bool,
    /// May be removed through the xattr interface.
    pub removable: bool,
    /// A value change requires a metadata commit.
    pub commit_required: bool,
}

impl XattrFlags {
    /// Flags for caller-created attributes.
    pub const USER: Self = Self {
        writable: true,
        serializable: true,
        visible: true,
        removable: true,
        commit_required: true,
    };

    /// Flags for the reserved entries that mirror object fields.
    pub const READ_ONLY: Self = Self {
        writable: false,
        serializable: false,
        visible: true,
        removable: false,
        commit_required: false,
    };
}

/// One extended attribute.
#[derive(Debug, Clone)]
pub struct Xattr {
    /// Attribute bytes.
    pub value: Vec<u8>,
    /// Capabilities of this entry.
    pub flags: XattrFlags,
}

impl Xattr {
    /// A caller-writable attribute.
    pub fn user(value: Vec<u8>) -> Self {
        Self {
            value,
            flags: XattrFlags::USER,
        }
    }

    /// A read-only attribute mirroring an object field.
    pub fn read_only(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            flags: XattrFlags::READ_ONLY,
        }
    }
}

/// How a set operation treats an existing (or missing) attribute, mirroring
/// `XATTR_CREATE` / `XATTR_REPLACE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Create or replace.
    Any,
    /// Fail with `EEXIST` when the attribute already exists.
    Create,
    /// Fail with `ENODATA` when the attribute does not exist.
    Replace,
}

impl SetMode {
    /// Maps the flags argument of `setxattr(2)`.
    pub fn from_libc(flags: i32) -> Self {
        if flags & libc::XATTR_CREATE != 0 {
            SetMode::Create
        } else if flags & libc::XATTR_REPLACE != 0 {
            SetMode::Replace
        } else {
            SetMode::Any
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_mode_from_libc() {
        assert_eq!(SetMode::from_libc(0), SetMode::Any);
        assert_eq!(SetMode::from_libc(libc::XATTR_CREATE), SetMode::Create);
        assert_eq!(SetMode::from_libc(libc::XATTR_REPLACE), SetMode::Replace);
    }

    #[test]
    fn test_flag_presets() {
        assert!(XattrFlags::USER.writable);
        assert!(XattrFlags::USER.commit_required);
        assert!(!XattrFlags::READ_ONLY.writable);
        assert!(XattrFlags::READ_ONLY.visible);
    }
}
