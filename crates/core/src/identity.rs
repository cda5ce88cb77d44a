//! RoleX identity loader.
//!
//! Reads `.identity.feature` Gherkin files from the RoleX directory
//! layout ({rolex_dir}/roles/{role}/identity/) and converts them into
//! prompt sections. Experiences learned at runtime are written back to
//! the same directory.

use std::path::PathBuf;
use std::sync::LazyLock;

use gp_domain::context::{ContextSection, IdentityFeature, IdentityKind, SectionCategory};
use gp_domain::error::Result;

static FEATURE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?m)^\s*Feature:\s*(.+)$").unwrap());

/// Identity type from the RoleX filename convention:
/// `persona.identity.feature`, `*.knowledge.identity.feature`,
/// `*.experience.identity.feature`, `*.voice.identity.feature`.
fn detect_identity_kind(filename: &str) -> IdentityKind {
    if filename == "persona.identity.feature" {
        return IdentityKind::Persona;
    }
    if filename.ends_with(".knowledge.identity.feature") {
        return IdentityKind::Knowledge;
    }
    if filename.ends_with(".experience.identity.feature") {
        return IdentityKind::Experience;
    }
    if filename.ends_with(".voice.identity.feature") {
        return IdentityKind::Voice;
    }
    IdentityKind::Knowledge
}

fn extract_feature_name(content: &str) -> String {
    FEATURE_RE
        .captures(content)
        .map(|c| c[1].trim().to_owned())
        .unwrap_or_else(|| "unnamed".to_owned())
}

/// Loads identity features from the filesystem and persists experiences.
pub struct IdentityLoader {
    rolex_dir: PathBuf,
}

impl IdentityLoader {
    pub fn new(rolex_dir: &str) -> Self {
        let expanded = if let Some(rest) = rolex_dir.strip_prefix("~/") {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(rest))
                .unwrap_or_else(|_| PathBuf::from(rolex_dir))
        } else {
            PathBuf::from(rolex_dir)
        };
        Self { rolex_dir: expanded }
    }

    fn identity_dir(&self, role_name: &str) -> PathBuf {
        self.rolex_dir.join("roles").join(role_name).join("identity")
    }

    /// Load all identity features for a role, sorted by filename.
    pub fn load_identity(&self, role_name: &str) -> Vec<IdentityFeature> {
        let dir = self.identity_dir(role_name);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            tracing::warn!(dir = %dir.display(), "identity dir not found");
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".identity.feature"))
            })
            .collect();
        paths.sort();

        let mut features = Vec::new();
        for path in paths {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_owned();
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    features.push(IdentityFeature {
                        kind: detect_identity_kind(&filename),
                        name: extract_feature_name(&content),
                        content,
                        source_file: path.display().to_string(),
                    });
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load identity file"),
            }
        }

        tracing::info!(
            count = features.len(),
            role = role_name,
            "identity features loaded"
        );
        features
    }

    /// Save an experience feature into the role's identity directory.
    pub fn save_experience(
        &self,
        role_name: &str,
        exp_name: &str,
        gherkin_source: &str,
    ) -> Result<()> {
        let dir = self.identity_dir(role_name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{exp_name}.experience.identity.feature"));
        std::fs::write(&path, gherkin_source)?;
        tracing::info!(name = exp_name, path = %path.display(), "experience saved");
        Ok(())
    }
}

/// Convert identity features into prompt sections.
///
/// Persona and voice land in Identity (priority 0/1), knowledge and
/// experience in their own categories with running priorities. When a
/// persona exists, a directive section instructs the LLM to prefix
/// responses with `[RoleName]` and embody the persona.
pub fn features_to_sections(
    features: &[IdentityFeature],
    role_name: &str,
) -> Vec<ContextSection> {
    let mut sections = Vec::new();
    let mut knowledge_idx = 0;
    let mut experience_idx = 0;
    let mut has_persona = false;

    for feature in features {
        match feature.kind {
            IdentityKind::Persona => {
                has_persona = true;
                sections.push(
                    ContextSection::new(
                        format!("identity_persona_{}", feature.name),
                        SectionCategory::Identity,
                        feature.content.clone(),
                    )
                    .with_priority(0),
                );
            }
            IdentityKind::Voice => {
                sections.push(
                    ContextSection::new(
                        format!("identity_voice_{}", feature.name),
                        SectionCategory::Identity,
                        feature.content.clone(),
                    )
                    .with_priority(1),
                );
            }
            IdentityKind::Knowledge => {
                sections.push(
                    ContextSection::new(
                        format!("knowledge_{}", feature.name),
                        SectionCategory::Knowledge,
                        feature.content.clone(),
                    )
                    .with_priority(knowledge_idx),
                );
                knowledge_idx += 1;
            }
            IdentityKind::Experience => {
                sections.push(
                    ContextSection::new(
                        format!("experience_{}", feature.name),
                        SectionCategory::Experience,
                        feature.content.clone(),
                    )
                    .with_priority(experience_idx),
                );
                experience_idx += 1;
            }
        }
    }

    if has_persona && !role_name.is_empty() {
        let mut chars = role_name.chars();
        let display_name = chars
            .next()
            .map(|c| c.to_uppercase().collect::<String>() + chars.as_str())
            .unwrap_or_default();
        sections.push(
            ContextSection::new(
                "identity_directive",
                SectionCategory::Identity,
                format!(
                    "You have been given a persona identity above. \
                     You MUST prefix every response with [{display_name}] \
                     to indicate your active identity. \
                     Embody this persona in your communication style, \
                     thinking approach, and problem-solving methodology. \
                     Your experiences and knowledge shape how you respond."
                ),
            )
            .with_priority(2),
        );
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_detection_from_filenames() {
        assert_eq!(
            detect_identity_kind("persona.identity.feature"),
            IdentityKind::Persona
        );
        assert_eq!(
            detect_identity_kind("nodes.knowledge.identity.feature"),
            IdentityKind::Knowledge
        );
        assert_eq!(
            detect_identity_kind("fix.experience.identity.feature"),
            IdentityKind::Experience
        );
        assert_eq!(
            detect_identity_kind("tone.voice.identity.feature"),
            IdentityKind::Voice
        );
        assert_eq!(
            detect_identity_kind("something.identity.feature"),
            IdentityKind::Knowledge
        );
    }

    #[test]
    fn feature_name_extraction() {
        assert_eq!(
            extract_feature_name("Feature: Workflow Recovery\n  Scenario: x"),
            "Workflow Recovery"
        );
        assert_eq!(extract_feature_name("no gherkin here"), "unnamed");
    }

    #[test]
    fn load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let loader = IdentityLoader::new(dir.path().to_str().unwrap());

        loader
            .save_experience("artist", "first-lesson", "Feature: First Lesson\n")
            .unwrap();

        let features = loader.load_identity("artist");
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].kind, IdentityKind::Experience);
        assert_eq!(features[0].name, "First Lesson");
    }

    #[test]
    fn missing_role_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loader = IdentityLoader::new(dir.path().to_str().unwrap());
        assert!(loader.load_identity("ghost").is_empty());
    }

    #[test]
    fn sections_map_by_kind_with_directive() {
        let features = vec![
            IdentityFeature {
                kind: IdentityKind::Persona,
                name: "Artist".into(),
                content: "Feature: Artist".into(),
                source_file: String::new(),
            },
            IdentityFeature {
                kind: IdentityKind::Knowledge,
                name: "Nodes".into(),
                content: "Feature: Nodes".into(),
                source_file: String::new(),
            },
            IdentityFeature {
                kind: IdentityKind::Experience,
                name: "Lesson".into(),
                content: "Feature: Lesson".into(),
                source_file: String::new(),
            },
        ];
        let sections = features_to_sections(&features, "artist");
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].category, SectionCategory::Identity);
        assert_eq!(sections[1].category, SectionCategory::Knowledge);
        assert_eq!(sections[2].category, SectionCategory::Experience);

        let directive = &sections[3];
        assert_eq!(directive.name, "identity_directive");
        assert!(directive.content.contains("[Artist]"));
    }

    #[test]
    fn no_persona_means_no_directive() {
        let features = vec![IdentityFeature {
            kind: IdentityKind::Knowledge,
            name: "Nodes".into(),
            content: "Feature: Nodes".into(),
            source_file: String::new(),
        }];
        let sections = features_to_sections(&features, "artist");
        assert_eq!(sections.len(), 1);
    }
}
