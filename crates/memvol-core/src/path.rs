//! Name comparison and path walking.
//!
//! The comparator defined here is the single source of truth for name
//! ordering and equality across the engine: directory lookup, insertion
//! order inside a tooth, re-sorting after rename, the enumeration marker
//! search, and the duplicate check all go through [`compare_names`]. Using
//! two different comparators anywhere would corrupt the per-tooth sorted
//! runs, so nothing else in the crate compares names directly.

use std::cmp::Ordering;

use compact_str::CompactString;

use crate::error::FsError;
use crate::model::node::NodeIndex;
use crate::volume::Volume;

/// Path component separator. Paths use Windows conventions throughout.
pub const SEPARATOR: char = '\\';

/// Ordinal single-code-point case fold.
///
/// Maps a character to its uppercase form when that form is a single code
/// point; characters with multi-character uppercase expansions compare
/// as-is. This matches ordinal-ignore-case semantics (a per-unit table
/// lookup, not linguistic collation).
fn fold_char(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

/// Compare two names under the volume's case policy.
///
/// Case-sensitive comparison is plain byte-wise ordering. Case-insensitive
/// comparison folds each code point through [`fold_char`] before comparing.
pub fn compare_names(a: &str, b: &str, ignore_case: bool) -> Ordering {
    if !ignore_case {
        return a.cmp(b);
    }
    let mut ca = a.chars().map(fold_char);
    let mut cb = b.chars().map(fold_char);
    loop {
        match (ca.next(), cb.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Name equality under the volume's case policy.
pub fn equal_names(a: &str, b: &str, ignore_case: bool) -> bool {
    compare_names(a, b, ignore_case) == Ordering::Equal
}

/// Split a path into its non-empty components.
///
/// Leading, trailing, and doubled separators yield empty segments which are
/// skipped, so `\foo\bar\` walks the same nodes as `foo\bar`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Resolve a full path to a node index, walking from the root.
///
/// Returns [`FsError::PathNotFound`] when a component is missing or an
/// intermediate component is not a directory, and
/// [`FsError::ReparseIntermediate`] when an intermediate directory carries
/// the reparse-point attribute (the caller owns reparse resolution).
pub fn walk(volume: &Volume, path: &str) -> Result<NodeIndex, FsError> {
    let mut current = NodeIndex::ROOT;
    for part in components(path) {
        let node = volume.get(current);
        if !node.is_directory() {
            return Err(FsError::PathNotFound);
        }
        if node.is_reparse_point() {
            return Err(FsError::ReparseIntermediate);
        }
        let (child, _) = volume.lookup(current, part).ok_or(FsError::PathNotFound)?;
        current = child;
    }
    Ok(current)
}

/// Resolve a path to its parent directory plus leaf name.
///
/// The leaf itself is not required to exist; every intermediate component
/// is, with the same error behavior as [`walk`]. An empty path (the root)
/// has no parent and reports [`FsError::PathNotFound`].
pub fn resolve_parent<'p>(
    volume: &Volume,
    path: &'p str,
) -> Result<(NodeIndex, &'p str), FsError> {
    let trimmed = path.trim_end_matches(SEPARATOR);
    let leaf_start = trimmed.rfind(SEPARATOR).map(|i| i + 1).unwrap_or(0);
    let leaf = &trimmed[leaf_start..];
    if leaf.is_empty() {
        return Err(FsError::PathNotFound);
    }
    let parent = walk(volume, &trimmed[..leaf_start])?;
    if !volume.get(parent).is_directory() {
        return Err(FsError::PathNotFound);
    }
    Ok((parent, leaf))
}

/// Recompose a path from the canonical names stored in the tree.
///
/// Under case-insensitive mode the stored spelling wins, so a lookup for
/// `\FOO\bar` returns `\Foo\Bar` if that is how the entries were created.
/// Under case-sensitive mode there is nothing to normalize and the caller
/// keeps its input: this returns `None`.
pub fn normalized_path(volume: &Volume, path: &str) -> Result<Option<String>, FsError> {
    if !volume.is_case_insensitive() {
        // Validate the walk even though the input spelling is kept.
        walk(volume, path)?;
        return Ok(None);
    }
    let mut current = NodeIndex::ROOT;
    let mut normalized: Vec<CompactString> = Vec::new();
    for part in components(path) {
        let node = volume.get(current);
        if !node.is_directory() {
            return Err(FsError::PathNotFound);
        }
        if node.is_reparse_point() {
            return Err(FsError::ReparseIntermediate);
        }
        let (child, stored) = volume
            .lookup(current, part)
            .ok_or(FsError::PathNotFound)?;
        normalized.push(stored.expect("case-insensitive lookup returns the stored name"));
        current = child;
    }
    let mut out = String::new();
    for name in &normalized {
        out.push(SEPARATOR);
        out.push_str(name);
    }
    if out.is_empty() {
        out.push(SEPARATOR);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_case_sensitive_is_ordinal() {
        assert_eq!(compare_names("Zebra", "apple", false), Ordering::Less);
        assert_eq!(compare_names("apple", "apple", false), Ordering::Equal);
        assert_eq!(compare_names("b", "a", false), Ordering::Greater);
    }

    #[test]
    fn test_compare_ignore_case_folds() {
        assert_eq!(compare_names("readme.TXT", "README.txt", true), Ordering::Equal);
        assert_eq!(compare_names("ärger", "ÄRGER", true), Ordering::Equal);
        // Folding is to uppercase, so lowercase letters sort with their
        // uppercase forms rather than after them.
        assert_eq!(compare_names("apple", "Zebra", true), Ordering::Less);
    }

    #[test]
    fn test_equal_names_respects_policy() {
        assert!(equal_names("Foo", "foo", true));
        assert!(!equal_names("Foo", "foo", false));
    }

    #[test]
    fn test_components_skips_empty_segments() {
        let parts: Vec<&str> = components("\\foo\\\\bar\\").collect();
        assert_eq!(parts, vec!["foo", "bar"]);
        assert_eq!(components("").count(), 0);
        assert_eq!(components("\\").count(), 0);
    }

    use crate::model::node::{FileAttributes, Timestamps};
    use crate::options::VolumeOptions;

    fn sample_volume(case_sensitive: bool) -> Volume {
        let options = VolumeOptions {
            total_size: 8 << 20,
            case_sensitive,
            ..VolumeOptions::default()
        };
        Volume::new(&options).unwrap()
    }

    fn add_dir(volume: &Volume, parent: NodeIndex, name: &str) -> NodeIndex {
        volume
            .create(
                parent,
                name,
                FileAttributes::DIRECTORY,
                0,
                Timestamps::all(1),
            )
            .unwrap()
    }

    #[test]
    fn test_walk_resolves_nested_path() {
        let volume = sample_volume(false);
        let users = add_dir(&volume, NodeIndex::ROOT, "Users");
        let home = add_dir(&volume, users, "home");

        assert_eq!(walk(&volume, "\\Users\\home"), Ok(home));
        assert_eq!(walk(&volume, "users\\HOME"), Ok(home));
        assert_eq!(walk(&volume, ""), Ok(NodeIndex::ROOT));
        assert_eq!(walk(&volume, "\\Users\\gone"), Err(FsError::PathNotFound));
    }

    #[test]
    fn test_walk_stops_at_reparse_intermediate() {
        let volume = sample_volume(false);
        let link = volume
            .create(
                NodeIndex::ROOT,
                "mnt",
                FileAttributes::DIRECTORY | FileAttributes::REPARSE_POINT,
                0xA000_0003,
                Timestamps::all(1),
            )
            .unwrap();

        // The reparse directory itself resolves; walking through it does not.
        assert_eq!(walk(&volume, "\\mnt"), Ok(link));
        assert_eq!(
            walk(&volume, "\\mnt\\inside"),
            Err(FsError::ReparseIntermediate)
        );
    }

    #[test]
    fn test_resolve_parent_splits_leaf() {
        let volume = sample_volume(false);
        let users = add_dir(&volume, NodeIndex::ROOT, "Users");

        let (parent, leaf) = resolve_parent(&volume, "\\Users\\newfile.txt").unwrap();
        assert_eq!(parent, users);
        assert_eq!(leaf, "newfile.txt");

        let (parent, leaf) = resolve_parent(&volume, "toplevel").unwrap();
        assert_eq!(parent, NodeIndex::ROOT);
        assert_eq!(leaf, "toplevel");

        assert_eq!(resolve_parent(&volume, "\\"), Err(FsError::PathNotFound));
    }

    #[test]
    fn test_normalized_path_uses_stored_spelling() {
        let volume = sample_volume(false);
        let users = add_dir(&volume, NodeIndex::ROOT, "Users");
        add_dir(&volume, users, "Alice");

        assert_eq!(
            normalized_path(&volume, "\\USERS\\alice").unwrap(),
            Some("\\Users\\Alice".to_string())
        );

        let sensitive = sample_volume(true);
        add_dir(&sensitive, NodeIndex::ROOT, "Users");
        assert_eq!(normalized_path(&sensitive, "\\Users").unwrap(), None);
    }
}
