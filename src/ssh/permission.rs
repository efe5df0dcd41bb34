use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use super::error::Error;

/// Access bits granted to a single role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const EXECUTE: Permission = Permission(1);
    pub const WRITE: Permission = Permission(2);
    pub const READ: Permission = Permission(4);
    pub const ALL: Permission = Permission(7);

    /// Build from a raw octal digit. Values above 7 are rejected.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits <= 7 {
            Some(Permission(bits))
        } else {
            None
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

/// Owner / group / everyone permission triple, e.g. `755`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilePermission {
    pub owner: Permission,
    pub group: Permission,
    pub everyone: Permission,
}

impl FilePermission {
    /// `rwxr-xr-x`
    pub const DIRECTORY: FilePermission = FilePermission {
        owner: Permission::ALL,
        group: Permission(5),
        everyone: Permission(5),
    };

    /// `rw-r--r--`
    pub const FILE: FilePermission = FilePermission {
        owner: Permission(6),
        group: Permission::READ,
        everyone: Permission::READ,
    };

    pub const fn new(owner: Permission, group: Permission, everyone: Permission) -> Self {
        Self { owner, group, everyone }
    }

    /// Numeric mode as passed to mkdir/setstat (`0o755` for `"755"`).
    pub const fn mode(&self) -> u32 {
        ((self.owner.0 as u32) << 6) | ((self.group.0 as u32) << 3) | self.everyone.0 as u32
    }

    /// Three concatenated digits, e.g. `"755"`.
    pub fn mode_string(&self) -> String {
        self.to_string()
    }
}

impl Default for FilePermission {
    fn default() -> Self {
        FilePermission::DIRECTORY
    }
}

impl fmt::Display for FilePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.owner.0, self.group.0, self.everyone.0)
    }
}

impl FromStr for FilePermission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidConfig(format!("invalid permission string {s:?}"));
        let digits: Vec<Permission> = s
            .chars()
            .map(|c| {
                c.to_digit(8)
                    .and_then(|d| Permission::from_bits(d as u8))
                    .ok_or_else(invalid)
            })
            .collect::<Result<_, _>>()?;
        match digits.as_slice() {
            [owner, group, everyone] => Ok(FilePermission::new(*owner, *group, *everyone)),
            _ => Err(invalid()),
        }
    }
}
