// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! File path normalization. The frontend reports paths as the compiler
//! saw them; the databases key on a canonical form so the same file
//! compiled from different directories lands under one key.

use std::path::{Component, Path, PathBuf};

/// Normalize a source path against the working directory it was compiled
/// from and the base directory of the checkout. Special compiler paths
/// like `<built-in>` pass through unchanged; paths under the base
/// directory become relative to it.
pub fn normalize_file(file: &str, working_dir: &Path, base_dir: &Path) -> String {
    // special compiler paths pass through unchanged.
    if file.starts_with('<') {
        return file.to_string();
    }

    let path = Path::new(file);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    };
    let canonical = squash_dots(&absolute);

    match canonical.strip_prefix(base_dir) {
        Ok(relative) => relative.to_string_lossy().into_owned(),
        Err(_) => canonical.to_string_lossy().into_owned(),
    }
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem. Symbolic links are not chased; the frontend reports the
/// path it actually opened.
fn squash_dots(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_against_working_dir() {
        let working = Path::new("/build/project/src");
        let base = Path::new("/build/project");
        assert_eq!(normalize_file("list.c", working, base), "src/list.c");
        assert_eq!(
            normalize_file("../include/list.h", working, base),
            "include/list.h"
        );
    }

    #[test]
    fn test_outside_base_stays_absolute() {
        let working = Path::new("/build/project");
        let base = Path::new("/build/project");
        assert_eq!(
            normalize_file("/usr/include/stdio.h", working, base),
            "/usr/include/stdio.h"
        );
    }

    #[test]
    fn test_compiler_paths_pass_through() {
        let working = Path::new("/build");
        let base = Path::new("/build");
        assert_eq!(normalize_file("<built-in>", working, base), "<built-in>");
        assert_eq!(
            normalize_file("<command-line>", working, base),
            "<command-line>"
        );
    }
}
