/// Value at `index` of the first tag named `name` that has one.
pub(crate) fn tag_value_at<'a>(
    tags: &'a [Vec<String>],
    name: &str,
    index: usize,
) -> Option<&'a str> {
    tags.iter()
        .filter(|tag| has_name(tag, name))
        .find_map(|tag| tag.get(index))
        .map(String::as_str)
}

/// First value of every tag named `name`, in tag order.
pub(crate) fn tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    tags.iter()
        .filter(|tag| has_name(tag, name))
        .filter_map(|tag| tag.get(1).cloned())
        .collect()
}

pub(crate) fn has_name(tag: &[String], name: &str) -> bool {
    tag.first().is_some_and(|tag_name| tag_name == name)
}
