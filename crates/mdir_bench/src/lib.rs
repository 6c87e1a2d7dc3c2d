//! Shared inputs for the mdir benchmarks.

use mdir_codec::Header;
use mdir_core::digest_bytes;
use mdir_protocol::Patch;

/// A file document whose encoding is roughly `size` bytes.
pub fn file_document(index: usize, size: usize) -> Header {
    let name = format!("file-{index:06}.dat");
    let digest = digest_bytes(name.as_bytes());
    let padding = "x".repeat(size.saturating_sub(120));
    Header::file(name, digest.as_str(), digest.as_str()).with("note", padding)
}

/// A contiguous chain of `count` ADD patches of about `size` bytes each.
pub fn chain(count: usize, size: usize) -> Vec<Patch> {
    (0..count)
        .map(|i| Patch::add(i as i64, file_document(i, size)))
        .collect()
}

/// `items` in a fixed scrambled order: a stride walk that visits every
/// index once when `stride` is coprime with the length.
pub fn scrambled<T: Clone>(items: &[T], stride: usize) -> Vec<T> {
    let len = items.len();
    (0..len).map(|i| items[(i * stride) % len].clone()).collect()
}
