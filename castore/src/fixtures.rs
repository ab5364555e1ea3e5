use crate::{B3Digest, Digest, Directory, Node, PathComponent};
use lazy_static::lazy_static;

pub const HELLOWORLD_BLOB_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref DUMMY_DIGEST: B3Digest = {
        let u: &[u8; 32] = &[0x00; 32];
        u.into()
    };
    pub static ref DUMMY_DIGEST_2: B3Digest = {
        let mut u = [0x00; 32];
        u[0] = 0x10;
        (&u).into()
    };

    pub static ref HELLOWORLD_BLOB_DIGEST: Digest = Digest::of_bytes(HELLOWORLD_BLOB_CONTENTS);
    pub static ref EMPTY_BLOB_DIGEST: Digest = Digest::of_bytes(EMPTY_BLOB_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: Digest = Digest::of_bytes(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: Digest = Digest::of_bytes(&BLOB_B);

    // Directories
    pub static ref DIRECTORY_WITH_KEEP: Directory = Directory::try_from_iter([(
        PathComponent::try_from(".keep").unwrap(),
        Node::File {
            digest: EMPTY_BLOB_DIGEST.hash.clone(),
            size: 0,
            executable: false,
        },
    )])
    .unwrap();
    pub static ref DIRECTORY_COMPLICATED: Directory = Directory::try_from_iter([
        (
            PathComponent::try_from("keep").unwrap(),
            Node::Directory {
                digest: DIRECTORY_WITH_KEEP.digest().hash().clone(),
                size: DIRECTORY_WITH_KEEP.size(),
            },
        ),
        (
            PathComponent::try_from(".keep").unwrap(),
            Node::File {
                digest: EMPTY_BLOB_DIGEST.hash.clone(),
                size: 0,
                executable: false,
            },
        ),
        (
            PathComponent::try_from("aa").unwrap(),
            Node::Symlink {
                target: "/somewhere/else".try_into().unwrap(),
            },
        ),
    ])
    .unwrap();
    pub static ref DIRECTORY_A: Directory = Directory::new();
    pub static ref DIRECTORY_B: Directory = Directory::try_from_iter([(
        PathComponent::try_from("a").unwrap(),
        Node::Directory {
            digest: DIRECTORY_A.digest().hash().clone(),
            size: DIRECTORY_A.size(),
        },
    )])
    .unwrap();
    pub static ref DIRECTORY_C: Directory = Directory::try_from_iter([
        (
            PathComponent::try_from("a").unwrap(),
            Node::Directory {
                digest: DIRECTORY_A.digest().hash().clone(),
                size: DIRECTORY_A.size(),
            },
        ),
        (
            PathComponent::try_from("a'").unwrap(),
            Node::Directory {
                digest: DIRECTORY_A.digest().hash().clone(),
                size: DIRECTORY_A.size(),
            },
        ),
    ])
    .unwrap();
}
