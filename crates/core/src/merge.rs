use std::sync::Arc;

use spindle_protocol::SharedStr;

use crate::model::CallSite;

/// Resolves the exact signature of a line-based call site, so that
/// overloads sharing a name are not merged on export.
pub trait MethodDisambiguator: Send + Sync {
    fn descriptor_for(
        &self,
        class_name: &str,
        method_name: &str,
        line: Option<u32>,
    ) -> Option<SharedStr>;
}

/// Export-time policy deciding whether two sibling nodes are the same call
/// site.
#[derive(Clone, Default)]
pub struct MergeMode {
    separate_parent_calls: bool,
    disambiguator: Option<Arc<dyn MethodDisambiguator>>,
}

impl MergeMode {
    /// Merge siblings that call the same method.
    pub fn same_method() -> Self {
        Self::default()
    }

    /// Merge siblings that call the same method from the same caller line.
    pub fn separate_parent_calls() -> Self {
        Self {
            separate_parent_calls: true,
            disambiguator: None,
        }
    }

    pub fn with_disambiguator(mut self, disambiguator: Arc<dyn MethodDisambiguator>) -> Self {
        self.disambiguator = Some(disambiguator);
        self
    }

    pub fn separates_parent_calls(&self) -> bool {
        self.separate_parent_calls
    }

    pub fn should_merge(&self, a: &CallSite, b: &CallSite) -> bool {
        if !a.same_method(b) {
            return false;
        }
        if self.separate_parent_calls && a.parent_line_number() != b.parent_line_number() {
            return false;
        }
        match (self.descriptor(a), self.descriptor(b)) {
            (Some(da), Some(db)) => da == db,
            _ => true,
        }
    }

    fn descriptor(&self, site: &CallSite) -> Option<SharedStr> {
        if let Some(descriptor) = site.method_descriptor() {
            return Some(descriptor.clone());
        }
        self.disambiguator.as_ref().and_then(|d| {
            d.descriptor_for(&site.class_name, &site.method_name, site.line_number())
        })
    }
}

impl std::fmt::Debug for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeMode")
            .field("separate_parent_calls", &self.separate_parent_calls)
            .field("disambiguator", &self.disambiguator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_line_splits_only_in_separate_mode() {
        let a = CallSite::line("Net", "read", Some(10), Some(100));
        let b = CallSite::line("Net", "read", Some(12), Some(200));
        assert!(MergeMode::same_method().should_merge(&a, &b));
        assert!(!MergeMode::separate_parent_calls().should_merge(&a, &b));

        let c = CallSite::line("Net", "read", Some(30), Some(100));
        assert!(MergeMode::separate_parent_calls().should_merge(&a, &c));
    }

    #[test]
    fn different_methods_never_merge() {
        let a = CallSite::line("Net", "read", Some(1), None);
        let b = CallSite::line("Net", "write", Some(1), None);
        let c = CallSite::line("Disk", "read", Some(1), None);
        let mode = MergeMode::same_method();
        assert!(!mode.should_merge(&a, &b));
        assert!(!mode.should_merge(&a, &c));
    }

    #[test]
    fn descriptors_keep_overloads_apart() {
        let a = CallSite::descriptor("Buf", "put", "(I)V");
        let b = CallSite::descriptor("Buf", "put", "(J)V");
        let c = CallSite::descriptor("Buf", "put", "(I)V");
        let mode = MergeMode::same_method();
        assert!(!mode.should_merge(&a, &b));
        assert!(mode.should_merge(&a, &c));
    }

    struct ByLine;

    impl MethodDisambiguator for ByLine {
        fn descriptor_for(&self, _: &str, _: &str, line: Option<u32>) -> Option<SharedStr> {
            match line? {
                1..=50 => Some("(I)V".into()),
                _ => Some("(J)V".into()),
            }
        }
    }

    #[test]
    fn disambiguator_resolves_line_sites() {
        let a = CallSite::line("Buf", "put", Some(10), None);
        let b = CallSite::line("Buf", "put", Some(90), None);
        let c = CallSite::line("Buf", "put", Some(20), None);
        let mode = MergeMode::same_method().with_disambiguator(Arc::new(ByLine));
        assert!(!mode.should_merge(&a, &b));
        assert!(mode.should_merge(&a, &c));
        assert!(MergeMode::same_method().should_merge(&a, &b));
    }
}
