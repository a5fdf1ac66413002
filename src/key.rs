//! Hierarchical path parsing and decomposition.
//!
//! A [`Key`] is a non-owning view over already-validated text, in one of two
//! shapes: a *leaf* (a single segment matching `[A-Za-z][\w-]*`) or a *path*
//! (a leading `/` followed by one or more `/`-separated segments of the same
//! shape, or the singleton root `"/"` with no segments at all). All
//! decompositions return views borrowed from the original input — callers
//! must keep the backing string alive for as long as the returned `Key`s are
//! used.

use crate::error::{Error, Result};

const SEPARATOR: char = '/';

/// A validated view over hierarchical path text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Key<'a> {
    view: &'a str,
}

impl<'a> Key<'a> {
    /// Validates `s` and wraps it as a `Key`. Fails if `s` is neither a
    /// valid leaf nor a valid path.
    pub fn new(s: &'a str) -> Result<Self> {
        if is_valid(s) {
            Ok(Key { view: s })
        } else {
            Err(Error::InvalidKey)
        }
    }

    /// The root path, `"/"`.
    pub fn root() -> Key<'static> {
        Key { view: "/" }
    }

    pub fn as_str(&self) -> &'a str {
        self.view
    }

    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// True if this key is a path (starts with `/`), including the root.
    pub fn is_path(&self) -> bool {
        self.view.starts_with(SEPARATOR)
    }

    /// True if this key is a single leaf segment.
    pub fn is_leaf(&self) -> bool {
        !self.view.is_empty() && !self.is_path()
    }

    /// True if this key is exactly the root path.
    pub fn is_root(&self) -> bool {
        self.view == "/"
    }

    /// Splits a path into its first segment and the remaining path.
    ///
    /// The remaining part retains its leading separator, so it can be fed
    /// back into `split_at_head` to walk a path one segment at a time. On
    /// the root (no segments), both parts are empty.
    pub fn split_at_head(&self) -> Result<(Key<'a>, Key<'a>)> {
        if !self.is_path() {
            return Err(Error::InvalidLogicalPath);
        }
        let bytes = self.view.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i] == b'/' {
            i += 1;
        }
        if i == bytes.len() {
            return Ok((Key { view: "" }, Key { view: "" }));
        }
        match self.view[i..].find(SEPARATOR) {
            None => Ok((Key { view: &self.view[i..] }, Key { view: "" })),
            Some(off) => {
                let sep = i + off;
                Ok((
                    Key { view: &self.view[i..sep] },
                    Key { view: &self.view[sep..] },
                ))
            }
        }
    }

    /// Splits a path into its parent and its last segment.
    ///
    /// The last-segment part retains its leading separator. On the root (no
    /// segments), both parts are empty.
    pub fn split_at_tail(&self) -> Result<(Key<'a>, Key<'a>)> {
        if !self.is_path() {
            return Err(Error::InvalidLogicalPath);
        }
        let bytes = self.view.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i] == b'/' {
            i += 1;
        }
        if i == bytes.len() {
            return Ok((Key { view: "" }, Key { view: "" }));
        }
        let sep = self.view.rfind(SEPARATOR).expect("path has a separator");
        Ok((
            Key { view: &self.view[..sep] },
            Key { view: &self.view[sep..] },
        ))
    }

    /// If `self` lies strictly under `superkey`, returns the remaining
    /// suffix path (with leading separator). Both keys must be paths.
    pub fn is_subkey(&self, superkey: &Key<'a>) -> Result<(bool, Key<'a>)> {
        if !self.is_path() || !superkey.is_path() {
            return Err(Error::InvalidLogicalPath);
        }
        if superkey.is_root() {
            return Ok((!self.is_root(), Key { view: self.view }));
        }
        let prefix = superkey.view;
        if self.view.len() > prefix.len()
            && self.view.starts_with(prefix)
            && self.view.as_bytes()[prefix.len()] == b'/'
        {
            Ok((true, Key { view: &self.view[prefix.len()..] }))
        } else {
            Ok((false, Key { view: "" }))
        }
    }

    /// If `subkey` lies strictly under `self`, returns the remaining suffix.
    pub fn is_superkey(&self, subkey: &Key<'a>) -> Result<(bool, Key<'a>)> {
        subkey.is_subkey(self)
    }

    /// Strips the leading `/` from a path, yielding the bare first segment
    /// (for a single-segment path) or an invalid view for deeper paths —
    /// callers only use this right after `split_at_head` has isolated a
    /// single segment's remainder.
    pub fn cut_lead_separator(&self) -> Result<Key<'a>> {
        if !self.is_path() {
            return Err(Error::InvalidLogicalPath);
        }
        Ok(Key { view: &self.view[1..] })
    }

    /// Iterates the segments of a path, deepest first to last, skipping the
    /// root's implicit empty segment list. Used internally by the Bloom
    /// filter and B-tree descent to walk a path one level at a time.
    pub(crate) fn segments(&self) -> impl Iterator<Item = &'a str> {
        self.view
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
    }
}

fn is_valid(s: &str) -> bool {
    if s == "/" {
        return true;
    }
    if let Some(rest) = s.strip_prefix('/') {
        !rest.is_empty() && rest.split(SEPARATOR).all(is_valid_segment)
    } else {
        is_valid_segment(s)
    }
}

fn is_valid_segment(seg: &str) -> bool {
    let mut chars = seg.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
