//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

use crate::{error::Error, utils::Result};

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// `RVersion` answer for a version the server cannot speak
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Tag carried by `TVersion`/`RVersion`
pub const NOTAG: u16 = !0;

/// "No fid", used as the `afid` of an unauthenticated `TAttach`
pub const NOFID: u32 = !0;

/// Header room reserved in `RRead`/`TWrite` when sizing data:
/// size[4] type[1] tag[2] fid[4] offset[8] count[4], rounded up
pub const IOHDRSZ: u32 = 24;

/// Maximum number of names in a single `TWalk`
pub const MAXWELEM: usize = 16;

/// size[4] type[1] tag[2]
pub const HEADER_SIZE: usize = 7;

/// Size of a `QId` on the wire: type[1] version[4] path[8]
pub const QID_SIZE: usize = size_of::<u8>() + size_of::<u32>() + size_of::<u64>();

/// Conventional 9P port
pub const STYX_PORT: u16 = 564;

/// Mode byte of `TOpen`/`TCreate`
pub mod om {
    /// Read only
    pub const READ: u8 = 0;
    /// Write only
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Read, checked against execute permission
    pub const EXEC: u8 = 3;
    /// Truncate on open
    pub const TRUNC: u8 = 16;
    /// Close on exec
    pub const CEXEC: u8 = 32;
    /// Remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in Dir.mode
pub mod dm {
    pub const DIR: u32 = 0x80000000;
    /// Append only
    pub const APPEND: u32 = 0x40000000;
    /// Exclusive use
    pub const EXCL: u32 = 0x20000000;
    pub const MOUNT: u32 = 0x10000000;
    /// Authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Not backed up
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links (9P2000.u)
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for device files (9P2000.u)
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes (9P2000.u)
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets (9P2000.u)
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid (9P2000.u)
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid (9P2000.u)
    pub const SETGID: u32 = 0x00040000;
    /// Per-class permission bits
    pub const READ: u32 = 0x4;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x1;
    /// Owner, group and other permission bits
    pub const PERM: u32 = 0o777;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// The high byte of `Dir.mode`, see [`QIdType::from_mode`].
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QIdType: u8 {
        const DIR       = 0x80;
        const APPEND    = 0x40;
        const EXCL      = 0x20;
        const MOUNT     = 0x10;
        const AUTH      = 0x08;
        const TMP       = 0x04;
        const SYMLINK   = 0x02;
        const LINK      = 0x01;
        const FILE      = 0x00;
    }
}

impl QIdType {
    /// Kind bits of a `Dir.mode` word.
    pub fn from_mode(mode: u32) -> QIdType {
        QIdType::from_bits_truncate((mode >> 24) as u8)
    }
}

/// Identity of a file on the server
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QId {
    /// Kind of file
    pub typ: QIdType,
    /// Version number for a file; changes every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy and
    /// stable for the lifetime of the server
    pub path: u64,
}

impl QId {
    pub fn is_dir(&self) -> bool {
        self.typ.contains(QIdType::DIR)
    }
}

/// Stat record of a file, as carried by `RStat` and `TWStat`
///
/// Integer fields set to all ones and empty strings mean "don't touch"
/// in `TWStat`, see [`Dir::null`].
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions and kind bits, see [`dm`]
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Dir {
    /// A Dir in which every field is "don't touch".
    pub fn null() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Encoded size, not counting the leading size[2] field itself.
    pub fn size(&self) -> usize {
        size_of::<u16>()
            + size_of::<u32>()
            + QID_SIZE
            + size_of::<u32>() * 3
            + size_of::<u64>()
            + size_of::<u16>() * 4
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()
    }

    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }
}

/// Access part of an open mode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    Exec,
}

/// Decoded `TOpen`/`TCreate` mode byte
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpenMode {
    pub access: Access,
    pub truncate: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        access: Access::Read,
        truncate: false,
    };

    /// Decode a mode byte.
    ///
    /// Remove-on-close is not supported and is refused with
    /// `PermissionDenied`. Close-on-exec has no meaning to a server and is
    /// ignored.
    pub fn from_bits(mode: u8) -> Result<OpenMode> {
        if mode & om::RCLOSE != 0 {
            return Err(Error::PermissionDenied);
        }

        let access = match mode & 3 {
            om::READ => Access::Read,
            om::WRITE => Access::Write,
            om::RDWR => Access::ReadWrite,
            _ => Access::Exec,
        };

        Ok(OpenMode {
            access,
            truncate: mode & om::TRUNC != 0,
        })
    }

    pub fn bits(&self) -> u8 {
        let access = match self.access {
            Access::Read => om::READ,
            Access::Write => om::WRITE,
            Access::ReadWrite => om::RDWR,
            Access::Exec => om::EXEC,
        };
        if self.truncate { access | om::TRUNC } else { access }
    }

    pub fn is_readable(&self) -> bool {
        self.access != Access::Write
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.access, Access::Write | Access::ReadWrite)
    }
}

/// Payload of `RRead` and `TWrite`, encoded as count[4] followed by the bytes
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "9P2000 message type codes"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// Request?
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// Response?
    ///
    /// Requests carry even codes, their responses the following odd code.
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// Body of a 9P2000 message
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    /// The stat[n] length prefix is handled in Encodable/Decodable traits.
    RStat {
        stat: Dir,
    },
    TWStat {
        fid: u32,
        stat: Dir,
    },
    RWStat,
}

impl FCall {
    /// Build an `RError` from an error, cutting the message down to what a
    /// 16-bit string length can carry.
    pub fn error(e: &Error) -> FCall {
        let mut ename = e.to_string();
        if ename.len() > u16::MAX as usize {
            let mut end = u16::MAX as usize;
            while !ename.is_char_boundary(end) {
                end -= 1;
            }
            ename.truncate(end);
        }
        FCall::RError { ename }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn responses_follow_requests() {
        for code in (100u8..128).step_by(2) {
            let t = MsgType::from_u8(code).unwrap();
            let r = MsgType::from_u8(code + 1).unwrap();
            assert!(t.is_t());
            assert!(r.is_r());
        }
        assert!(MsgType::from_u8(99).is_none());
        assert!(MsgType::from_u8(128).is_none());
    }

    #[test]
    fn open_mode_bits() {
        let mode = OpenMode::from_bits(om::RDWR | om::TRUNC).unwrap();
        assert_eq!(mode.access, Access::ReadWrite);
        assert!(mode.truncate);
        assert!(mode.is_readable() && mode.is_writable());
        assert_eq!(mode.bits(), om::RDWR | om::TRUNC);

        let exec = OpenMode::from_bits(om::EXEC | om::CEXEC).unwrap();
        assert_eq!(exec.access, Access::Exec);
        assert!(exec.is_readable() && !exec.is_writable());

        assert!(!OpenMode::from_bits(om::WRITE).unwrap().is_readable());
        assert!(matches!(
            OpenMode::from_bits(om::READ | om::RCLOSE),
            Err(Error::PermissionDenied)
        ));
    }

    #[test]
    fn qid_type_mirrors_mode() {
        assert_eq!(QIdType::from_mode(dm::DIR | 0o755), QIdType::DIR);
        assert_eq!(
            QIdType::from_mode(dm::APPEND | dm::EXCL | 0o644),
            QIdType::APPEND | QIdType::EXCL
        );
        assert_eq!(QIdType::from_mode(0o644), QIdType::FILE);
    }

    #[test]
    fn error_messages_are_bounded() {
        let long = Error::Backend("é".repeat(40_000));
        match FCall::error(&long) {
            FCall::RError { ename } => {
                assert!(ename.len() <= u16::MAX as usize);
                assert!(ename.len() >= u16::MAX as usize - 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dir_size_counts_strings() {
        let dir = Dir {
            name: "a".into(),
            uid: "bb".into(),
            gid: "ccc".into(),
            muid: String::new(),
            ..Default::default()
        };
        // type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8] 4*len[2]
        assert_eq!(dir.size(), 2 + 4 + 13 + 4 + 4 + 4 + 8 + 8 + 6);
    }
}
