use std::{fs, io, path::Path};

use bytes::Bytes;
use rand::Rng;

/// One candidate request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParam {
    pub content: Bytes,
}

impl RequestParam {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Lossy text form, used when logging a response next to its input.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Ordered request-body variants, read-only for the whole run.
#[derive(Debug, Clone, Default)]
pub struct RequestParamSet {
    params: Vec<RequestParam>,
    empty: RequestParam,
}

impl RequestParamSet {
    pub fn new(params: Vec<RequestParam>) -> Self {
        Self {
            params,
            empty: RequestParam::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn push(&mut self, param: RequestParam) {
        self.params.push(param);
    }

    pub fn append(&mut self, other: RequestParamSet) {
        self.params.extend(other.params);
    }

    /// Variant for a global request index, wrapping around the set.
    pub fn sequential(&self, index: usize) -> &RequestParam {
        match self.params.len() {
            0 => &self.empty,
            len => &self.params[index % len],
        }
    }

    /// Uniformly drawn variant.
    pub fn random<R: Rng>(&self, rng: &mut R) -> &RequestParam {
        match self.params.len() {
            0 => &self.empty,
            len => &self.params[rng.random_range(0..len)],
        }
    }

    /// One variant per non-empty line.
    pub fn from_lines(raw: &[u8]) -> Self {
        let params = raw
            .split(|b| *b == b'\n')
            .map(|row| row.strip_suffix(b"\r").unwrap_or(row))
            .filter(|row| !row.is_empty())
            .map(|row| RequestParam::new(Bytes::copy_from_slice(row)))
            .collect();
        Self::new(params)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = fs::read(path)?;
        Ok(Self::from_lines(&raw))
    }
}
