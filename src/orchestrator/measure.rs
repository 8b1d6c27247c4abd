use crate::dom::{Document, NodeId};

/// Intrinsic height of the widget.
///
/// Prefers the `#root` box. A zero-height root (absolutely positioned
/// content) falls back to the extent of its visible children, then to
/// `<body>` and `<html>`.
pub fn intrinsic_height(document: &Document) -> Option<f64> {
    if let Some(root) = document.element_by_id("root") {
        if let Some(height) = own_height(document, root) {
            return Some(height);
        }
        if let Some(height) = composite_height(document, root) {
            return Some(height);
        }
    }
    [document.body(), document.document_element()]
        .into_iter()
        .flatten()
        .find_map(|id| own_height(document, id))
}

fn own_height(document: &Document, id: NodeId) -> Option<f64> {
    document
        .layout(id)
        .filter(|layout| layout.visible && layout.height > 0.0)
        .map(|layout| layout.height.ceil())
}

/// Distance from the highest top to the lowest bottom among visible
/// descendants of `root`, measured from `root`'s own top.
fn composite_height(document: &Document, root: NodeId) -> Option<f64> {
    let origin = document.layout(root).map(|layout| layout.top).unwrap_or(0.0);
    let bottom = document
        .descendants(root)
        .into_iter()
        .filter_map(|id| document.layout(id))
        .filter(|layout| layout.visible && layout.height > 0.0)
        .map(|layout| layout.bottom())
        .fold(None, |lowest: Option<f64>, bottom| {
            Some(lowest.map_or(bottom, |lowest| lowest.max(bottom)))
        })?;
    let height = (bottom - origin).ceil();
    (height > 0.0).then_some(height)
}

/// Background color the host should paint behind the frame.
pub fn background_color(document: &Document) -> Option<String> {
    [document.body(), document.document_element()]
        .into_iter()
        .flatten()
        .find_map(|id| {
            document
                .inline_style(id, "background-color")
                .or_else(|| document.inline_style(id, "background"))
        })
        .filter(|color| !color.is_empty() && !color.eq_ignore_ascii_case("transparent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::LayoutBox;

    fn document() -> Document {
        Document::parse(
            "<html><body style=\"background-color: #101010\"><div id=\"root\"><div class=\"a\"></div><div class=\"b\"></div></div></body></html>",
        )
    }

    #[test]
    fn prefers_root_box() {
        let mut doc = document();
        let root = doc.element_by_id("root").unwrap();
        doc.set_layout(root, LayoutBox::new(0.0, 240.4)).unwrap();
        doc.set_layout(doc.body().unwrap(), LayoutBox::new(0.0, 900.0)).unwrap();
        assert_eq!(intrinsic_height(&doc), Some(241.0));
    }

    #[test]
    fn zero_height_root_uses_children_extent() {
        let mut doc = document();
        let root = doc.element_by_id("root").unwrap();
        let children = doc.children(root).to_vec();
        doc.set_layout(root, LayoutBox::new(10.0, 0.0)).unwrap();
        doc.set_layout(children[0], LayoutBox::new(10.0, 100.0)).unwrap();
        doc.set_layout(children[1], LayoutBox::new(80.0, 150.0)).unwrap();
        assert_eq!(intrinsic_height(&doc), Some(220.0));

        doc.set_layout(
            children[1],
            LayoutBox {
                top: 80.0,
                height: 150.0,
                visible: false,
            },
        )
        .unwrap();
        assert_eq!(intrinsic_height(&doc), Some(100.0));
    }

    #[test]
    fn falls_back_to_body_then_html() {
        let mut doc = Document::parse("<html><body></body></html>");
        assert_eq!(intrinsic_height(&doc), None);
        let html = doc.document_element().unwrap();
        doc.set_layout(html, LayoutBox::new(0.0, 50.0)).unwrap();
        assert_eq!(intrinsic_height(&doc), Some(50.0));
        doc.set_layout(doc.body().unwrap(), LayoutBox::new(0.0, 30.0)).unwrap();
        assert_eq!(intrinsic_height(&doc), Some(30.0));
    }

    #[test]
    fn reads_background_color() {
        assert_eq!(background_color(&document()).as_deref(), Some("#101010"));
        let plain = Document::parse("<body style=\"background: transparent\"></body>");
        assert_eq!(background_color(&plain), None);
    }
}
