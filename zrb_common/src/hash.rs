// zrb_common is the main zrb library implementing the backup pipeline shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::ZrbError;

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// A `Hasher` is a streaming BLAKE3 accumulator
/// producing a lowercase hex digest of everything fed into it.
#[derive(Default)]
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    /// Returns a new, empty `Hasher`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the provided bytes into the accumulator.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consumes the `Hasher` and returns the digest as lowercase hex.
    pub fn finalize_hex(self) -> String {
        self.inner.finalize().to_hex().to_string()
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Returns the BLAKE3 digest of everything the provided reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<String, ZrbError> {
    let mut hasher = Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize_hex())
}

/// Returns the BLAKE3 digest of the entire contents of the file at `path`.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String, ZrbError> {
    hash_reader(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    // BLAKE3 of the empty input.
    const EMPTY_DIGEST: &str = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262";

    #[test]
    fn empty_digest_is_known_vector() {
        assert_eq!(Hasher::new().finalize_hex(), EMPTY_DIGEST);
        assert_eq!(hash_reader(Cursor::new(b"")).unwrap(), EMPTY_DIGEST);
    }

    #[test]
    fn incremental_updates_match_single_update() {
        let mut split = Hasher::new();
        split.update(b"zfs remote");
        split.update(b" backup");

        let mut whole = Hasher::new();
        whole.update(b"zfs remote backup");

        assert_eq!(split.finalize_hex(), whole.finalize_hex());
    }

    #[test]
    fn file_digest_matches_reader_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(
            hash_file(&path).unwrap(),
            hash_reader(Cursor::new(&data)).unwrap()
        );
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let mut hasher = Hasher::new();
        hasher.update(b"case check");
        let digest = hasher.finalize_hex();

        assert_eq!(digest.len(), 64);
        assert!(digest
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
