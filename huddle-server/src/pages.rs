//! Static page content seam. Real page/icon generation is an external
//! collaborator; the built-in implementation serves a minimal shell so the
//! daemon works on its own.

/// Provider of static page bodies for GET routes.
pub trait StaticContent: Send + Sync {
    /// Body and content type for a path, or None when the path is unknown.
    fn page(&self, path: &str) -> Option<(String, &'static str)>;
}

pub struct BuiltinPages;

impl StaticContent for BuiltinPages {
    fn page(&self, path: &str) -> Option<(String, &'static str)> {
        match path {
            "/" | "/index.html" => Some((INDEX_HTML.to_string(), "text/html")),
            _ => None,
        }
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Huddle</title>
</head>
<body>
  <h1>Huddle</h1>
  <p>Connect a chat client over WebSocket to start talking.</p>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_served_and_unknown_paths_are_not() {
        let pages = BuiltinPages;
        let (body, content_type) = pages.page("/").unwrap();
        assert!(body.contains("<html"));
        assert_eq!(content_type, "text/html");
        assert!(pages.page("/missing").is_none());
    }
}
