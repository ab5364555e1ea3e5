use super::DirectoryService;
use crate::{B3Digest, Directory, Error, Node};
use async_stream::stream;
use futures::stream::BoxStream;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

/// Traverses a [Directory] from the root to the children.
///
/// This is mostly BFS, but directories are only returned once.
/// A missing root yields an empty stream, a missing child is an error.
pub fn traverse_directory<'a, DS: DirectoryService + 'static>(
    directory_service: DS,
    root_directory_digest: &B3Digest,
) -> BoxStream<'a, Result<Directory, Error>> {
    // The list of all directories that still need to be traversed. The next
    // element is picked from the front, new elements are enqueued at the
    // back.
    let mut worklist_directory_digests: VecDeque<B3Digest> =
        VecDeque::from([root_directory_digest.clone()]);
    // The list of directory digests already sent to the consumer.
    // We omit sending the same directories multiple times.
    let mut sent_directory_digests: HashSet<B3Digest> = HashSet::new();
    let root_directory_digest = root_directory_digest.clone();

    let stream = stream! {
        while let Some(current_directory_digest) = worklist_directory_digests.pop_front() {
            match directory_service.get(&current_directory_digest).await {
                Ok(None) if current_directory_digest == root_directory_digest => {
                    return;
                }
                // if it's not there, we have an inconsistent store!
                Ok(None) => {
                    warn!(directory.digest=%current_directory_digest, "directory does not exist");
                    yield Err(Error::StorageError(format!(
                        "directory {} does not exist",
                        current_directory_digest
                    )));
                    return;
                }
                Err(e) => {
                    warn!(directory.digest=%current_directory_digest, "failed to look up directory");
                    yield Err(Error::StorageError(format!(
                        "unable to look up directory {}: {}",
                        current_directory_digest, e
                    )));
                    return;
                }

                // if we got it
                Ok(Some(current_directory)) => {
                    // We're about to send this directory, so let's avoid sending it again if a
                    // descendant has it.
                    sent_directory_digests.insert(current_directory_digest);

                    // enqueue all child directory digests to the work queue, as
                    // long as they're not part of the worklist or already sent.
                    for (_name, node) in current_directory.nodes() {
                        if let Node::Directory { digest, .. } = node {
                            if worklist_directory_digests.contains(digest)
                                || sent_directory_digests.contains(digest)
                            {
                                continue;
                            }
                            worklist_directory_digests.push_back(digest.clone());
                        }
                    }

                    yield Ok(current_directory);
                }
            };
        }
    };

    Box::pin(stream)
}
