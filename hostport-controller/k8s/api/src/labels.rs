use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Identifies a pod by its own name.
///
/// Network policies can only select pods by label, so pods that expose host
/// ports are labeled with their name to make them individually selectable.
pub const IDENTITY_LABEL: &str = "field.cattle.io/podName";

// === Selectors ===

/// Builds a selector that matches exactly the pod named `pod_name`.
pub fn identity_selector(pod_name: impl Into<String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            Some((IDENTITY_LABEL.to_string(), pod_name.into()))
                .into_iter()
                .collect(),
        ),
        match_expressions: None,
    }
}

/// Returns the pod name an identity selector targets.
pub fn selected_identity(selector: &LabelSelector) -> Option<&str> {
    selector
        .match_labels
        .as_ref()?
        .get(IDENTITY_LABEL)
        .map(String::as_str)
}
