use async_trait::async_trait;
use error::*;
use os::cmd;
use regex::{Captures, Regex};
use result::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Everything a user overlay template may reference.
///
/// Scalars are referenced as `{{.User}}`, maps as `{{.AppParams.idleTimeout}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateData {
    pub app: String,
    pub namespace: String,
    pub user: String,
    pub username: String,
    pub id: String,
    pub full_name: String,
    pub session_key: String,
    pub cookie_value: String,
    pub timestamp: String,
    pub app_params: BTreeMap<String, String>,
    pub user_params: BTreeMap<String, String>,
    pub sys_params: BTreeMap<String, String>,
}

impl TemplateData {
    fn lookup(&self, field: &str, key: Option<&str>) -> Option<&str> {
        let value = match (field, key) {
            ("App", None) => &self.app,
            ("Namespace", None) => &self.namespace,
            ("User", None) => &self.user,
            ("Username", None) => &self.username,
            ("ID", None) => &self.id,
            ("FullName", None) => &self.full_name,
            ("SessionKey", None) => &self.session_key,
            ("CookieValue", None) => &self.cookie_value,
            ("Timestamp", None) => &self.timestamp,
            ("AppParams", Some(key)) => self.app_params.get(key)?,
            ("UserParams", Some(key)) => self.user_params.get(key)?,
            ("SysParams", Some(key)) => self.sys_params.get(key)?,
            _ => return None,
        };
        Some(value.as_str())
    }
}

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*\.([A-Za-z0-9_]+)(?:\.([A-Za-z0-9_]+))?\s*\}\}").unwrap();
    static ref KIND: Regex = Regex::new(r"(?m)^kind: (.*)$").unwrap();
}

/// Substitutes every known placeholder. Unknown placeholders are left as they are.
pub fn render(template: &str, data: &TemplateData) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = caps.get(2).map(|m| m.as_str());
            match data.lookup(&caps[1], key) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// The distinct, sorted, object kinds found in a rendered multi-document YAML stream.
pub fn object_kinds(rendered: &str) -> Vec<String> {
    KIND.captures_iter(rendered)
        .map(|caps| caps[1].trim().to_string())
        .filter(|kind| !kind.is_empty())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// A Builder renders bundles (an app's pool bundle or a user's overlay) and reports what
/// they contain.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Replaces `dest` with a rendered copy of the tree at `source`.
    async fn build_overlay(&self, source: &Path, dest: &Path, data: &TemplateData) -> Result<()>;
    async fn discover_object_kinds(&self, dest: &Path) -> Result<Vec<String>>;
    /// A digest over every file below `dir`, stable for as long as no file changes.
    async fn checksum(&self, dir: &Path) -> Result<String>;
}

/// Renders overlays on the local filesystem and inspects them with `kustomize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KustomizeBuilder;

#[async_trait]
impl Builder for KustomizeBuilder {
    async fn build_overlay(&self, source: &Path, dest: &Path, data: &TemplateData) -> Result<()> {
        match tokio::fs::remove_dir_all(dest).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(io_error(dest, err));
            }
            _ => (),
        }
        // Iterative rather than recursive, async fns cannot recurse without boxing.
        let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), dest.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            tokio::fs::create_dir_all(&to)
                .await
                .map_err(|err| io_error(&to, err))?;
            let mut entries = tokio::fs::read_dir(&from)
                .await
                .map_err(|err| io_error(&from, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| io_error(&from, err))?
            {
                let path = entry.path();
                let target = to.join(entry.file_name());
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| io_error(&path, err))?;
                if file_type.is_dir() {
                    pending.push((path, target));
                    continue;
                }
                let contents = tokio::fs::read(&path)
                    .await
                    .map_err(|err| io_error(&path, err))?;
                let contents = match String::from_utf8(contents) {
                    Ok(text) => render(&text, data).into_bytes(),
                    Err(binary) => binary.into_bytes(),
                };
                tokio::fs::write(&target, contents)
                    .await
                    .map_err(|err| io_error(&target, err))?;
            }
        }
        Ok(())
    }

    async fn discover_object_kinds(&self, dest: &Path) -> Result<Vec<String>> {
        let dir = dest.display().to_string();
        let rendered = cmd!("kustomize", "build", &dir).await?;
        Ok(object_kinds(&rendered))
    }

    async fn checksum(&self, dir: &Path) -> Result<String> {
        let mut files = BTreeMap::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|err| io_error(&current, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| io_error(&current, err))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| io_error(&path, err))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let contents = tokio::fs::read(&path)
                    .await
                    .map_err(|err| io_error(&path, err))?;
                let relative = path.strip_prefix(dir).unwrap_or(&path).display().to_string();
                files.insert(relative, contents);
            }
        }
        Ok(digest(&files))
    }
}

/// Hashes file names along with their contents, in name order, so that a rename counts
/// as a change too.
fn digest(files: &BTreeMap<String, Vec<u8>>) -> String {
    let mut input = Vec::new();
    for (name, contents) in files {
        input.extend_from_slice(name.as_bytes());
        input.push(0);
        input.extend_from_slice(contents);
        input.push(0);
    }
    names::hex_digest(input)
}

fn io_error(path: &Path, source: std::io::Error) -> Box<dyn BrokerError> {
    OverlayIo {
        path: path.display().to_string(),
        source,
    }
    .into()
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("Failed to render the bundle at {path}")]
pub struct OverlayIo {
    path: String,
    #[source]
    source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> TemplateData {
        let mut data = TemplateData {
            app: "editor".to_string(),
            namespace: "editor".to_string(),
            user: "alice@example.com".to_string(),
            username: "alice".to_string(),
            id: "0123456789".to_string(),
            full_name: "editor-0123456789".to_string(),
            session_key: "abc-defg-hij".to_string(),
            ..Default::default()
        };
        data.app_params
            .insert("idleTimeout".to_string(), "3600".to_string());
        data.user_params.insert("theme".to_string(), "dark".to_string());
        data.sys_params
            .insert("Domain".to_string(), "example.com".to_string());
        data
    }

    #[test]
    fn renders_fields_and_params() {
        let template = "name: {{.FullName}}\n\
            namespace: {{ .Namespace }}\n\
            host: {{.App}}.{{.SysParams.Domain}}\n\
            theme: {{.UserParams.theme}}\n\
            timeout: {{.AppParams.idleTimeout}}\n";
        assert_eq!(
            render(template, &data()),
            "name: editor-0123456789\n\
            namespace: editor\n\
            host: editor.example.com\n\
            theme: dark\n\
            timeout: 3600\n"
        );
    }

    #[test]
    fn unknown_placeholders_survive() {
        assert_eq!(
            render("{{.Nope}} {{.UserParams.missing}} {{ range }}", &data()),
            "{{.Nope}} {{.UserParams.missing}} {{ range }}"
        );
    }

    #[test]
    fn kinds() {
        let rendered = "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n---\n\
            apiVersion: networking.istio.io/v1alpha3\nkind: VirtualService\n---\n\
            apiVersion: v1\nkind: Service\n---\nspec:\n  template:\n    kind: Nested\n";
        assert_eq!(
            object_kinds(rendered),
            vec!["Service".to_string(), "VirtualService".to_string()]
        );
        assert!(object_kinds("").is_empty());
    }

    #[tokio::test]
    async fn renders_a_tree() {
        let root = std::env::temp_dir().join(format!("broker-builder-{}", names::random_secret()));
        let source = root.join("src");
        let dest = root.join("out");
        tokio::fs::create_dir_all(source.join("patches")).await.unwrap();
        tokio::fs::write(source.join("kustomization.yaml"), "namePrefix: {{.FullName}}-\n")
            .await
            .unwrap();
        tokio::fs::write(source.join("patches").join("theme.yaml"), "value: {{.UserParams.theme}}\n")
            .await
            .unwrap();
        // A stale file from an earlier build must not survive.
        tokio::fs::create_dir_all(&dest).await.unwrap();
        tokio::fs::write(dest.join("stale.yaml"), "old").await.unwrap();

        KustomizeBuilder
            .build_overlay(&source, &dest, &data())
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read_to_string(dest.join("kustomization.yaml")).await.unwrap(),
            "namePrefix: editor-0123456789-\n"
        );
        assert_eq!(
            tokio::fs::read_to_string(dest.join("patches").join("theme.yaml"))
                .await
                .unwrap(),
            "value: dark\n"
        );
        assert!(!dest.join("stale.yaml").exists());
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn checksum_tracks_contents() {
        let root = std::env::temp_dir().join(format!("broker-builder-{}", names::random_secret()));
        tokio::fs::create_dir_all(root.join("patches")).await.unwrap();
        tokio::fs::write(root.join("kustomization.yaml"), "resources: []\n")
            .await
            .unwrap();
        tokio::fs::write(root.join("patches").join("a.yaml"), "a: 1\n")
            .await
            .unwrap();
        let first = KustomizeBuilder.checksum(&root).await.unwrap();
        assert_eq!(first, KustomizeBuilder.checksum(&root).await.unwrap());

        tokio::fs::write(root.join("patches").join("a.yaml"), "a: 2\n")
            .await
            .unwrap();
        let second = KustomizeBuilder.checksum(&root).await.unwrap();
        assert_ne!(first, second);

        tokio::fs::rename(root.join("patches").join("a.yaml"), root.join("patches").join("b.yaml"))
            .await
            .unwrap();
        assert_ne!(second, KustomizeBuilder.checksum(&root).await.unwrap());
        tokio::fs::remove_dir_all(&root).await.unwrap();
        assert!(KustomizeBuilder.checksum(&root).await.is_err());
    }

    #[tokio::test]
    async fn missing_source() {
        let root = std::env::temp_dir().join(format!("broker-builder-{}", names::random_secret()));
        assert!(KustomizeBuilder
            .build_overlay(&root.join("nope"), &root.join("out"), &data())
            .await
            .is_err());
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
