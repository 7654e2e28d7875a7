use similar::TextDiff;

/*
 * Unified diff of two YAML documents with the whole document as context,
 * so the operator sees the complete before and after.
 */
pub fn unified_diff(current: &str, new: &str) -> String {
    let context = current.lines().count().max(new.lines().count()) + 1;
    TextDiff::from_lines(current, new)
	.unified_diff()
	.context_radius(context)
	.header("current", "new")
	.to_string()
}
