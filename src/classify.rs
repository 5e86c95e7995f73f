//! Maps the files of a project directory to the roles the loader knows about.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;

use crate::error::IngestError;
use crate::fs_util;
use crate::trace::TRACE_FILENAME;

#[derive(Debug, Clone)]
pub struct ClassifyPatterns {
    pub structure: Regex,
    pub topology: Regex,
    pub metadata: Regex,
    pub references: Regex,
    pub project_files: Regex,
    pub trajectories: Regex,
    /// The first capture group is the analysis name.
    pub analyses: Regex,
}

impl Default for ClassifyPatterns {
    fn default() -> Self {
        let pattern = |raw: &str| Regex::new(raw).expect("default classify pattern is valid");
        Self {
            structure: pattern(r"^structure\.pdb$"),
            topology: pattern(r"^topology\.json$"),
            metadata: pattern(r"^metadata\.json$"),
            references: pattern(r"^references\.json$"),
            project_files: pattern(r"^.*\.(pdb|tpr|top|prmtop|psf|gro)$"),
            trajectories: pattern(r"^trajectory.*\.(xtc|trr|dcd|nc|mdcrd|dump)$"),
            analyses: pattern(r"^mda\.(.+)\.json$"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassifiedProject {
    pub root: Utf8PathBuf,
    pub structure: Option<Utf8PathBuf>,
    pub topology: Option<Utf8PathBuf>,
    pub metadata: Option<Utf8PathBuf>,
    pub references: Option<Utf8PathBuf>,
    pub files: Vec<Utf8PathBuf>,
    pub mds: Vec<ClassifiedMd>,
}

#[derive(Debug, Clone)]
pub struct ClassifiedMd {
    pub dir: Utf8PathBuf,
    pub name: String,
    pub metadata: Option<Utf8PathBuf>,
    pub trajectories: Vec<Utf8PathBuf>,
    pub files: Vec<Utf8PathBuf>,
    pub analyses: Vec<ClassifiedAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedAnalysis {
    pub name: String,
    pub path: Utf8PathBuf,
}

#[derive(Deserialize)]
struct NamedMetadata {
    name: Option<String>,
}

/// Classifies `root` and its MD run directories.
///
/// Without `md_dirs` every subdirectory is a run, in name order. Relative
/// entries of `md_dirs` are taken from `root`.
pub async fn classify(
    root: &Utf8Path,
    md_dirs: &[Utf8PathBuf],
    patterns: &ClassifyPatterns,
) -> Result<ClassifiedProject, IngestError> {
    if !is_dir(root).await {
        return Err(IngestError::MissingFile(root.to_path_buf()));
    }
    let (files, subdirs) = fs_util::list_dir(root).await?;

    let mut project = ClassifiedProject {
        root: root.to_path_buf(),
        ..ClassifiedProject::default()
    };
    for path in files {
        let Some(name) = path.file_name() else {
            continue;
        };
        if name == TRACE_FILENAME {
            continue;
        }
        if patterns.structure.is_match(name) {
            project.structure = Some(path.clone());
        } else if patterns.topology.is_match(name) {
            project.topology = Some(path.clone());
            continue;
        } else if patterns.metadata.is_match(name) {
            project.metadata = Some(path.clone());
            continue;
        } else if patterns.references.is_match(name) {
            project.references = Some(path.clone());
            continue;
        }
        if patterns.project_files.is_match(name) {
            project.files.push(path);
        }
    }

    let run_dirs = if md_dirs.is_empty() {
        subdirs
    } else {
        let mut dirs = Vec::with_capacity(md_dirs.len());
        for dir in md_dirs {
            let dir = if dir.is_absolute() {
                dir.clone()
            } else {
                root.join(dir)
            };
            if !is_dir(&dir).await {
                return Err(IngestError::MissingFile(dir));
            }
            dirs.push(dir);
        }
        dirs
    };

    let mut seen = HashSet::new();
    for dir in run_dirs {
        let md = classify_md(&dir, patterns).await?;
        if !seen.insert(md.name.clone()) {
            return Err(IngestError::DuplicateMdRun(md.name));
        }
        project.mds.push(md);
    }
    Ok(project)
}

async fn is_dir(path: &Utf8Path) -> bool {
    tokio::fs::metadata(path.as_std_path())
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}

async fn classify_md(dir: &Utf8Path, patterns: &ClassifyPatterns) -> Result<ClassifiedMd, IngestError> {
    let (files, _) = fs_util::list_dir(dir).await?;
    let mut metadata = None;
    let mut trajectories = Vec::new();
    let mut analyses = Vec::new();
    let mut rest = Vec::new();

    for path in files {
        let Some(name) = path.file_name() else {
            continue;
        };
        if patterns.metadata.is_match(name) {
            metadata = Some(path.clone());
        } else if patterns.trajectories.is_match(name) {
            trajectories.push(path.clone());
        } else if let Some(captures) = patterns.analyses.captures(name) {
            let analysis = captures
                .get(1)
                .map(|group| group.as_str())
                .unwrap_or(name)
                .to_string();
            analyses.push(ClassifiedAnalysis {
                name: analysis,
                path: path.clone(),
            });
        } else {
            rest.push(path.clone());
        }
    }

    let named = match &metadata {
        Some(path) => fs_util::read_json_soft::<NamedMetadata>(path)
            .await
            .and_then(|meta| meta.name),
        None => None,
    };
    let name = named
        .filter(|name| !name.trim().is_empty())
        .or_else(|| dir.file_name().map(str::to_string))
        .unwrap_or_else(|| dir.to_string());

    Ok(ClassifiedMd {
        dir: dir.to_path_buf(),
        name,
        metadata,
        trajectories,
        files: rest,
        analyses,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn touch(path: &Utf8Path, content: &str) {
        std::fs::write(path.as_std_path(), content).unwrap();
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[tokio::test]
    async fn sorts_files_into_roles() {
        let (_temp, root) = scratch();
        touch(&root.join("structure.pdb"), "");
        touch(&root.join("topology.json"), "{}");
        touch(&root.join("metadata.json"), "{}");
        touch(&root.join("topol.tpr"), "");
        touch(&root.join("notes.txt"), "");
        touch(&root.join(TRACE_FILENAME), "{}");
        let run = root.join("replica_2");
        std::fs::create_dir(run.as_std_path()).unwrap();
        touch(&run.join("metadata.json"), r#"{ "name": "second" }"#);
        touch(&run.join("trajectory.xtc"), "");
        touch(&run.join("mda.rmsd.json"), "[]");
        touch(&run.join("energy.edr"), "");
        let first = root.join("replica_1");
        std::fs::create_dir(first.as_std_path()).unwrap();

        let project = classify(&root, &[], &ClassifyPatterns::default()).await.unwrap();
        assert_eq!(project.structure, Some(root.join("structure.pdb")));
        assert_eq!(project.topology, Some(root.join("topology.json")));
        assert_eq!(
            project.files,
            vec![root.join("structure.pdb"), root.join("topol.tpr")]
        );
        let names: Vec<_> = project.mds.iter().map(|md| md.name.as_str()).collect();
        assert_eq!(names, vec!["replica_1", "second"]);

        let md = &project.mds[1];
        assert_eq!(md.trajectories, vec![run.join("trajectory.xtc")]);
        assert_eq!(md.files, vec![run.join("energy.edr")]);
        assert_eq!(md.analyses[0].name, "rmsd");
    }

    #[tokio::test]
    async fn explicit_runs_must_exist() {
        let (_temp, root) = scratch();
        let err = classify(&root, &[Utf8PathBuf::from("missing")], &ClassifyPatterns::default())
            .await
            .unwrap_err();
        assert_matches!(err, IngestError::MissingFile(_));
    }

    #[tokio::test]
    async fn duplicate_run_names_are_rejected() {
        let (_temp, root) = scratch();
        for dir in ["a", "b"] {
            let run = root.join(dir);
            std::fs::create_dir(run.as_std_path()).unwrap();
            touch(&run.join("metadata.json"), r#"{ "name": "same" }"#);
        }
        let err = classify(&root, &[], &ClassifyPatterns::default())
            .await
            .unwrap_err();
        assert_matches!(err, IngestError::DuplicateMdRun(name) if name == "same");
    }
}
