use docrepo::registry::{schema_plugin, virtual_formatter};
use docrepo::{PluginExports, Repository, RepositoryConfig, SchemaQuery};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Formatters and schema plugins used by the definitions under `definitions/`
fn blog_plugin() -> PluginExports {
    PluginExports::new()
        .virtual_formatter(
            "excerpt",
            virtual_formatter(|record, args| {
                let field = args.first().and_then(Value::as_str).unwrap_or("body");
                let max_words = args.get(1).and_then(Value::as_u64).unwrap_or(20) as usize;
                let text = record.get(field);
                let words: Vec<&str> = text.as_str().unwrap_or_default().split_whitespace().collect();
                let mut excerpt = words.iter().take(max_words).copied().collect::<Vec<_>>().join(" ");
                if words.len() > max_words {
                    excerpt.push_str("...");
                }
                Value::String(excerpt)
            }),
        )
        .schema_plugin(
            "audited",
            schema_plugin(|schema, _options| {
                schema.pre_save(|doc| {
                    let revision = doc.get("revision").and_then(Value::as_u64).unwrap_or(0);
                    doc.insert("revision".into(), json!(revision + 1));
                    Ok(())
                });
            }),
        )
        .definition("definitions/*.yml")
}

fn config() -> docrepo::Result<RepositoryConfig> {
    if let Ok(path) = std::env::var("DOCREPO_CONFIG") {
        log::info!("Loading configuration from {path}");
        return RepositoryConfig::from_file(&PathBuf::from(path));
    }
    let connection_string =
        std::env::var("DOCREPO_CONNECTION").unwrap_or_else(|_| "sqlite://memory/blog".to_string());
    Ok(RepositoryConfig::new()
        .database("blog", &connection_string)
        .definitions_dir(env!("CARGO_MANIFEST_DIR")))
}

#[tokio::main]
async fn main() -> docrepo::Result<()> {
    env_logger::init();
    log::info!("Starting docrepo example");

    let repo = Repository::global();
    repo.configure(config()?);
    repo.plugin("blog", blog_plugin(), json!({ "db": "blog" }));

    let schemas = repo.schemas(&SchemaQuery::db("blog")).await?;
    for entry in schemas.iter() {
        log::info!("Compiled {}.{} -> models {:?}", entry.db, entry.name, entry.models);
    }

    repo.connection_ready("blog").await?;

    let users = repo.model("blog", "User").await?;
    let user = users
        .create(json!({
            "email": "Ada@Example.com",
            "password": "correct horse",
            "profile": { "displayName": "  Ada Lovelace " },
            "sessions": [{ "token": "abc123", "createdAt": "2024-05-01" }]
        }))
        .await?;
    println!("{}", json!({ "user": user.to_json(true) }));
    println!(
        "password ok: {}",
        user.call("verifyPassword", &[json!("correct horse")])?
    );

    let posts = repo.model("blog", "Post").await?;
    let post = posts
        .create(json!({
            "title": "Notes on the Analytical Engine and the numbers of Bernoulli computed by it",
            "author": user.id(),
            "tags": ["history", "computing"],
            "publishedAt": "1843-09-01"
        }))
        .await?;
    println!("{}", json!({ "post": post.to_json(true) }));

    if let Some(models) = posts.siblings() {
        log::info!("Models in blog: {:?}", models.keys().collect::<Vec<_>>());
    }

    repo.disconnect().await?;
    Ok(())
}
