use {
    nix::unistd::{Gid, Group, Uid, User},
    std::{fs::Metadata, os::unix::prelude::*},
    stor9p::{dm, fs::FileInfo},
};

/// Split `proto!addr!port`.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Kind and permission bits of a unix mode, in `Dir.mode` form.
pub fn dir_mode(attr: &Metadata) -> u32 {
    let typ = attr.file_type();
    let mode = attr.mode();

    let mut bits = mode & dm::PERM;
    if typ.is_dir() {
        bits |= dm::DIR;
    }
    if typ.is_symlink() {
        bits |= dm::SYMLINK;
    }
    if typ.is_block_device() || typ.is_char_device() {
        bits |= dm::DEVICE;
    }
    if typ.is_fifo() {
        bits |= dm::NAMEDPIPE;
    }
    if typ.is_socket() {
        bits |= dm::SOCKET;
    }
    if mode & 0o4000 != 0 {
        bits |= dm::SETUID;
    }
    if mode & 0o2000 != 0 {
        bits |= dm::SETGID;
    }
    bits
}

fn user_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

fn group_name(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
}

pub fn file_info(name: String, attr: &Metadata) -> FileInfo {
    let uid = user_name(attr.uid());
    FileInfo {
        name,
        mode: dir_mode(attr),
        length: if attr.is_dir() { 0 } else { attr.len() },
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        id: attr.ino(),
        muid: uid.clone(),
        uid,
        gid: group_name(attr.gid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_triples() {
        assert_eq!(
            parse_proto("tcp!0.0.0.0!564"),
            Some(("tcp", "0.0.0.0", "564"))
        );
        assert_eq!(
            parse_proto("unix!/tmp/dirfs.sock!0"),
            Some(("unix", "/tmp/dirfs.sock", "0"))
        );
        assert_eq!(parse_proto("tcp!localhost"), None);
    }

    #[test]
    fn modes_of_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"abc").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let attr = std::fs::metadata(&file).unwrap();
        assert_eq!(dir_mode(&attr), 0o640);

        let info = file_info("plain".into(), &attr);
        assert_eq!(info.length, 3);
        assert_eq!(info.id, attr.ino());

        let attr = std::fs::metadata(dir.path()).unwrap();
        assert!(dir_mode(&attr) & dm::DIR != 0);
        assert_eq!(file_info("d".into(), &attr).length, 0);
    }
}
