use anyhow::{bail, Result};

use crate::app::AppContext;
use crate::config::Config;
use crate::index_sync::MAX_PER_PAGE;
use crate::models::Post;
use crate::posts::views_of;

/// Rebuild the post index from the primary store.
pub async fn run_reindex(config: &Config) -> Result<()> {
    let app = AppContext::build(config.clone()).await?;
    if !app.search.is_enabled() {
        bail!("Search index is disabled. Set [search] backend in config.");
    }

    let written = app.search.reindex::<Post>(app.pool()).await?;
    println!("reindex");
    println!("  posts indexed: {}", written);
    Ok(())
}

/// Print one page of post search results.
pub async fn run_search(
    config: &Config,
    query: &str,
    page: i64,
    per_page: Option<i64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let app = AppContext::build(config.clone()).await?;
    let per_page = per_page
        .unwrap_or(config.app.posts_per_page)
        .clamp(1, MAX_PER_PAGE);
    let page = page.max(1);

    let (posts, total) = app
        .search
        .search::<Post>(app.pool(), query, page, per_page)
        .await?;
    if posts.is_empty() {
        println!("No results.");
        return Ok(());
    }

    let views = views_of(app.pool(), posts).await?;
    println!("{} results for \"{}\" (page {}):", total, query, page);
    for (i, post) in views.iter().enumerate() {
        let rank = (page - 1) * per_page + i as i64 + 1;
        println!();
        println!("{}. [post {}] {}  {}", rank, post.id, post.author, post.timestamp);
        println!("   {}", post.body);
    }
    Ok(())
}
