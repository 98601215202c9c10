pub const STUDY_AND_ROOT_PLACEHOLDER: &str = "<study_and_root_ph>";
pub const STUDY_PLACEHOLDER_WITH_DOT: &str = "<study_ph>.";
pub const STUDY_PLACEHOLDER_WITHOUT_DOT: &str = "<study_ph>";

/// Rewrites full paths into study-independent keys and back.
///
/// The study name and the `{study}.{root}` prefix are swapped for placeholders so that a
/// dump taken from one study can be loaded into another with a different name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAnonymizer {
    study_name: String,
    base_namespace: String,
}

impl KeyAnonymizer {
    pub fn new(study_name: &str, root_name: &str) -> Self {
        Self {
            study_name: study_name.to_string(),
            base_namespace: format!("{study_name}.{root_name}"),
        }
    }

    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    /// Replaces the study prefix of `key` with a placeholder.
    ///
    /// Rules are checked in order and the first match wins: the exact `{study}.{root}` key,
    /// a `{study}.{root}.` prefix, a `{study}.` prefix, then a bare `{study}` prefix.
    pub fn anonymize_key(&self, key: &str) -> String {
        let base = self.base_namespace.as_str();
        let study = self.study_name.as_str();

        if key == base {
            return STUDY_AND_ROOT_PLACEHOLDER.to_string();
        }
        if let Some(rest) = key
            .strip_prefix(base)
            .and_then(|r| r.strip_prefix('.'))
        {
            return format!("{STUDY_AND_ROOT_PLACEHOLDER}.{rest}");
        }
        if let Some(rest) = key.strip_prefix(study).and_then(|r| r.strip_prefix('.')) {
            return format!("{STUDY_PLACEHOLDER_WITH_DOT}{rest}");
        }
        if let Some(rest) = key.strip_prefix(study) {
            return format!("{STUDY_PLACEHOLDER_WITHOUT_DOT}{rest}");
        }
        key.to_string()
    }

    /// Inverse of [`KeyAnonymizer::anonymize_key`] for the current study.
    pub fn unanonymize_key(&self, key: &str) -> String {
        let base = self.base_namespace.as_str();
        let study = self.study_name.as_str();

        if key == STUDY_AND_ROOT_PLACEHOLDER {
            return base.to_string();
        }
        if let Some(rest) = key
            .strip_prefix(STUDY_AND_ROOT_PLACEHOLDER)
            .and_then(|r| r.strip_prefix('.'))
        {
            return format!("{base}.{rest}");
        }
        if let Some(rest) = key.strip_prefix(STUDY_PLACEHOLDER_WITH_DOT) {
            return format!("{study}.{rest}");
        }
        if let Some(rest) = key.strip_prefix(STUDY_PLACEHOLDER_WITHOUT_DOT) {
            return format!("{study}{rest}");
        }
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymizer() -> KeyAnonymizer {
        KeyAnonymizer::new("usecase", "Root")
    }

    #[test]
    fn rules_apply_in_priority_order() {
        let a = anonymizer();
        assert_eq!(a.anonymize_key("usecase.Root"), "<study_and_root_ph>");
        assert_eq!(a.anonymize_key("usecase.Root.x"), "<study_and_root_ph>.x");
        assert_eq!(a.anonymize_key("usecase.Disc1.a"), "<study_ph>.Disc1.a");
        assert_eq!(a.anonymize_key("usecase"), "<study_ph>");
        assert_eq!(a.anonymize_key("other.x"), "other.x");
    }

    #[test]
    fn bare_study_prefix_keeps_suffix_without_separator() {
        let a = anonymizer();
        assert_eq!(a.anonymize_key("usecase_2.x"), "<study_ph>_2.x");
        assert_eq!(a.unanonymize_key("<study_ph>_2.x"), "usecase_2.x");
    }

    #[test]
    fn keys_round_trip_for_every_rule() {
        let a = anonymizer();
        for key in [
            "usecase.Root",
            "usecase.Root.Disc.y",
            "usecase.y",
            "usecase",
            "Rootless.key",
        ] {
            assert_eq!(a.unanonymize_key(&a.anonymize_key(key)), key);
        }
    }

    #[test]
    fn anonymized_keys_load_into_a_renamed_study() {
        let source = KeyAnonymizer::new("old_study", "old_study");
        let target = KeyAnonymizer::new("new_study", "new_study");
        let key = source.anonymize_key("old_study.Disc1.a");
        assert_eq!(target.unanonymize_key(&key), "new_study.Disc1.a");
    }
}
