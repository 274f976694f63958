// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use std::{fs, time::Duration};
use testament_runner::{
    cache::{Cache, HttpCache},
    errors::HttpCacheError,
    fingerprint::CacheKey,
    label::BuildLabel,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn key() -> CacheKey {
    CacheKey::new((0..32).collect())
}

fn key_path() -> String {
    format!("/cache/{}", key().to_hex())
}

#[tokio::test(flavor = "multi_thread")]
async fn store_then_retrieve() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(key_path()))
        .and(header("Content-Type", "application/gzip"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let label = BuildLabel::new("pkg/sub", "t");
    let source = RepoFixture::new()?;
    source.write_output(&label, ".test_results_t_1", PASSING_GO)?;
    source.write_output(&label, "logs/extra.log", "extra")?;
    #[cfg(unix)]
    std::os::unix::fs::symlink(
        "logs/extra.log",
        source.layout().out_dir(&label).join("extra-link"),
    )?;

    let url = format!("{}/cache/", server.uri());
    let files = vec![
        ".test_results_t_1".to_owned(),
        "logs".to_owned(),
        #[cfg(unix)]
        "extra-link".to_owned(),
    ];
    let (layout, store_url, store_label) = (source.layout(), url.clone(), label.clone());
    tokio::task::spawn_blocking(move || {
        HttpCache::new(layout, &store_url, true, TIMEOUT).try_store(&store_label, &key(), &files)
    })
    .await??;

    let requests = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    ensure!(requests.len() == 1, "exactly one upload");
    let archive = requests[0].body.clone();

    Mock::given(method("GET"))
        .and(path(key_path()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(&server)
        .await;

    let dest = RepoFixture::new()?;
    let layout = dest.layout();
    let hit = tokio::task::spawn_blocking(move || {
        HttpCache::new(layout, &url, false, TIMEOUT).try_retrieve(&key())
    })
    .await??;
    ensure!(hit, "archive was retrieved");

    let out_dir = dest.layout().out_dir(&label);
    assert_eq!(
        fs::read_to_string(out_dir.join(".test_results_t_1"))?,
        PASSING_GO
    );
    assert_eq!(fs::read_to_string(out_dir.join("logs/extra.log"))?, "extra");
    #[cfg(unix)]
    assert_eq!(
        fs::read_link(out_dir.join("extra-link"))?,
        std::path::Path::new("logs/extra.log")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_outputs_give_identical_archives() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let label = BuildLabel::new("pkg", "t");
    let url = server.uri();
    for _ in 0..2 {
        // A fresh repository each time, so timestamps and inode order differ.
        let repo = RepoFixture::new()?;
        repo.write_output(&label, "b.txt", "b")?;
        repo.write_output(&label, "a.txt", "a")?;
        let (layout, url, label) = (repo.layout(), url.clone(), label.clone());
        tokio::task::spawn_blocking(move || {
            HttpCache::new(layout, &url, true, TIMEOUT).try_store(
                &label,
                &key(),
                &["a.txt".to_owned(), "b.txt".to_owned()],
            )
        })
        .await??;
    }

    let requests = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    ensure!(requests.len() == 2, "two uploads");
    ensure!(
        requests[0].body == requests[1].body,
        "archives should be byte-identical"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn not_found_is_a_miss() -> Result<()> {
    let server = MockServer::start().await;
    let repo = RepoFixture::new()?;
    let (layout, url) = (repo.layout(), server.uri());
    let (direct, via_trait) = tokio::task::spawn_blocking(move || {
        let cache = HttpCache::new(layout, &url, true, TIMEOUT);
        let label = BuildLabel::new("pkg", "t");
        let direct = cache.try_retrieve(&key());
        let via_trait = cache.retrieve(&label, &key(), &[]);
        (direct, via_trait)
    })
    .await?;

    ensure!(!direct?, "404 is a miss, not an error");
    ensure!(!via_trait, "404 is a miss");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn server_error_carries_body() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .mount(&server)
        .await;

    let repo = RepoFixture::new()?;
    let (layout, url) = (repo.layout(), server.uri());
    let (direct, via_trait) = tokio::task::spawn_blocking(move || {
        let cache = HttpCache::new(layout, &url, true, TIMEOUT);
        let direct = cache.try_retrieve(&key());
        let via_trait = cache.retrieve(&BuildLabel::new("pkg", "t"), &key(), &[]);
        (direct, via_trait)
    })
    .await?;

    match direct {
        Err(HttpCacheError::Status { status, body, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "disk full");
        }
        other => panic!("expected a status error, got {other:?}"),
    }
    ensure!(!via_trait, "errors are treated as a miss");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_cache_never_uploads() -> Result<()> {
    let server = MockServer::start().await;
    let label = BuildLabel::new("pkg", "t");
    let repo = RepoFixture::new()?;
    repo.write_output(&label, ".test_results_t_1", PASSING_GO)?;

    let (layout, url) = (repo.layout(), server.uri());
    tokio::task::spawn_blocking(move || {
        let cache = HttpCache::new(layout, &url, false, TIMEOUT);
        cache.store(&label, &key(), &[".test_results_t_1".to_owned()]);
        cache.shutdown();
    })
    .await?;

    let requests = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    ensure!(requests.is_empty(), "nothing was uploaded");
    Ok(())
}
