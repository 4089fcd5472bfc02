//! Box-drawing tree rendering for terminal listings

/// A labelled node with children
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeNode {
    pub label: String,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(label: impl Into<String>, children: Vec<TreeNode>) -> Self {
        Self {
            label: label.into(),
            children,
        }
    }
}

fn render_node(node: &TreeNode, prefix: &str, is_last: bool, lines: &mut Vec<String>) {
    let connector = if is_last { "└── " } else { "├── " };
    lines.push(format!("{}{}{}", prefix, connector, node.label));

    let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
    let last = node.children.len().saturating_sub(1);
    for (idx, child) in node.children.iter().enumerate() {
        render_node(child, &child_prefix, idx == last, lines);
    }
}

/// Render `roots` under a `root_label` header line
pub fn render_tree(root_label: &str, roots: &[TreeNode]) -> String {
    let mut lines = vec![root_label.to_string()];

    if roots.is_empty() {
        lines.push("└── (empty)".to_string());
        return lines.join("\n");
    }

    let last = roots.len() - 1;
    for (idx, root) in roots.iter().enumerate() {
        render_node(root, "", idx == last, &mut lines);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree() {
        assert_eq!(render_tree("USB", &[]), "USB\n└── (empty)");
    }

    #[test]
    fn test_nested_tree() {
        let roots = vec![
            TreeNode::with_children(
                "Bus 1",
                vec![TreeNode::leaf("1-1"), TreeNode::leaf("1-2")],
            ),
            TreeNode::with_children("Bus 2", vec![TreeNode::leaf("2-1")]),
        ];
        let expected = "\
USB
├── Bus 1
│   ├── 1-1
│   └── 1-2
└── Bus 2
    └── 2-1";
        assert_eq!(render_tree("USB", &roots), expected);
    }
}
