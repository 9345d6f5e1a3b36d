mod helpers;

use std::collections::HashSet;

use helpers::{axis, day, image_bytes, setup, Upload};
use mosaic::search::{Caller, SearchFilters};
use mosaic::service::{QueryInput, SearchParams};
use mosaic::store::Visibility::{Private, Public};
use mosaic::MosaicError;

fn scope(raw: &str) -> SearchParams {
    SearchParams {
        scope: raw.into(),
        ..Default::default()
    }
}

fn ids(result: &mosaic::search::SearchResult) -> Vec<&str> {
    result.hits.iter().map(|h| h.media_id.as_str()).collect()
}

fn query(v: &[f32]) -> QueryInput {
    QueryInput::Embedding(v.to_vec())
}

/// alice: one private, one public. bob: one private. One ownerless public item.
async fn seeded() -> helpers::TestEnv {
    let env = setup();
    for upload in [
        Upload::image("alice-private", Some("alice"), Private, &axis(0, 0.1)),
        Upload::image("alice-public", Some("alice"), Public, &axis(0, 0.2)),
        Upload::image("bob-private", Some("bob"), Private, &axis(0, 0.05)),
        Upload::image("system", None, Public, &axis(0, 0.3)),
    ] {
        assert!(env.upload(upload).await);
    }
    env
}

#[tokio::test]
async fn image_query_finds_itself_first() {
    let env = seeded().await;
    let bytes = image_bytes(&axis(0, 0.2));

    let result = env
        .service
        .search(QueryInput::Image(bytes), scope("all"), &Caller::user("alice"))
        .await
        .unwrap();

    assert_eq!(result.hits[0].media_id, "alice-public");
    assert!(result.hits[0].score >= 0.99, "score {}", result.hits[0].score);
}

#[tokio::test]
async fn all_scope_is_public_plus_own() {
    let env = seeded().await;

    let alice = env
        .service
        .search(query(&axis(0, 0.0)), scope("all"), &Caller::user("alice"))
        .await
        .unwrap();
    let seen: HashSet<_> = ids(&alice).into_iter().collect();
    assert_eq!(seen, HashSet::from(["alice-private", "alice-public", "system"]));
    assert_eq!(alice.total, 3);

    let anon = env
        .service
        .search(query(&axis(0, 0.0)), scope("all"), &Caller::anonymous())
        .await
        .unwrap();
    let seen: HashSet<_> = ids(&anon).into_iter().collect();
    assert_eq!(seen, HashSet::from(["alice-public", "system"]));
}

#[tokio::test]
async fn results_are_sorted_by_score() {
    let env = seeded().await;
    let result = env
        .service
        .search(query(&axis(0, 0.0)), scope("shared"), &Caller::anonymous())
        .await
        .unwrap();

    assert_eq!(ids(&result), vec!["alice-public", "system"]);
    assert!(result.hits[0].score >= result.hits[1].score);
}

#[tokio::test]
async fn owner_scope_requires_self_or_elevation() {
    let env = seeded().await;

    let mine = env
        .service
        .search(query(&axis(0, 0.0)), scope("my_images"), &Caller::user("bob"))
        .await
        .unwrap();
    assert_eq!(ids(&mine), vec!["bob-private"]);

    let err = env
        .service
        .search(query(&axis(0, 0.0)), scope("owner:bob"), &Caller::user("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::ScopeForbidden(_)));

    let admin = Caller::user("admin").with_elevated(true);
    let result = env
        .service
        .search(query(&axis(0, 0.0)), scope("owner:bob"), &admin)
        .await
        .unwrap();
    assert_eq!(ids(&result), vec!["bob-private"]);
}

#[tokio::test]
async fn anonymous_my_images_is_forbidden() {
    let env = seeded().await;
    let err = env
        .service
        .search(query(&axis(0, 0.0)), scope("my_images"), &Caller::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::ScopeForbidden(_)));
}

#[tokio::test]
async fn unknown_scope_is_invalid() {
    let env = seeded().await;
    let err = env
        .service
        .search(query(&axis(0, 0.0)), scope("everything"), &Caller::user("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::InvalidScope(_)));
}

#[tokio::test]
async fn private_media_of_others_never_leaks() {
    let env = seeded().await;
    for raw in ["all", "shared", "my_images"] {
        let result = env
            .service
            .search(query(&axis(0, 0.05)), scope(raw), &Caller::user("alice"))
            .await
            .unwrap();
        assert!(
            !ids(&result).contains(&"bob-private"),
            "bob-private leaked through scope {raw}"
        );
    }
}

#[tokio::test]
async fn collection_scope() {
    let env = seeded().await;
    env.store.create_collection("trip", "alice", "Trip", false).await.unwrap();
    env.store.add_to_collection("trip", "alice-private").await.unwrap();
    env.store.add_to_collection("trip", "system").await.unwrap();
    env.store.create_collection("empty", "alice", "Empty", true).await.unwrap();

    let result = env
        .service
        .search(query(&axis(0, 0.0)), scope("collection:trip"), &Caller::user("alice"))
        .await
        .unwrap();
    let seen: HashSet<_> = ids(&result).into_iter().collect();
    assert_eq!(seen, HashSet::from(["alice-private", "system"]));

    // Private collection of another user: empty, not an error.
    let result = env
        .service
        .search(query(&axis(0, 0.0)), scope("collection:trip"), &Caller::user("bob"))
        .await
        .unwrap();
    assert!(result.hits.is_empty());
    assert_eq!(result.total, 0);

    for raw in ["collection:empty", "collection:missing"] {
        let result = env
            .service
            .search(query(&axis(0, 0.0)), scope(raw), &Caller::user("alice"))
            .await
            .unwrap();
        assert!(result.hits.is_empty(), "{raw} should be empty");
    }
}

#[tokio::test]
async fn threshold_only_removes_results() {
    let env = setup();
    for (i, tilt) in [0.0f32, 0.5, 1.0, 2.0, 4.0].iter().enumerate() {
        env.upload(Upload::image(&format!("m{i}"), None, Public, &axis(0, *tilt))).await;
    }

    let mut previous: Option<HashSet<String>> = None;
    for threshold in [0.0f32, 0.3, 0.6, 0.9, 0.99] {
        let params = SearchParams {
            scope: "all".into(),
            threshold: Some(threshold),
            ..Default::default()
        };
        let result = env
            .service
            .search(query(&axis(0, 0.0)), params, &Caller::anonymous())
            .await
            .unwrap();
        assert!(result.hits.iter().all(|h| h.score >= threshold));

        let current: HashSet<String> = result.hits.iter().map(|h| h.media_id.clone()).collect();
        if let Some(prev) = &previous {
            assert!(current.is_subset(prev), "threshold {threshold} added results");
        }
        previous = Some(current);
    }
    assert_eq!(previous.unwrap(), HashSet::from(["m0".to_string()]));
}

#[tokio::test]
async fn pages_cover_every_match_once() {
    let env = setup();
    for i in 0..7 {
        env.upload(Upload::image(&format!("m{i}"), None, Public, &axis(0, i as f32 * 0.1))).await;
    }

    let mut seen = Vec::new();
    for page in 1..=3 {
        let params = SearchParams {
            scope: "shared".into(),
            page: Some(page),
            page_size: Some(3),
            ..Default::default()
        };
        let result = env
            .service
            .search(query(&axis(0, 0.0)), params, &Caller::anonymous())
            .await
            .unwrap();
        assert_eq!(result.total, 7);
        assert_eq!(result.page, page);
        seen.extend(result.hits.into_iter().map(|h| h.media_id));
    }

    assert_eq!(seen.len(), 7);
    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), 7);
    assert_eq!(seen[0], "m0");

    let past_end = SearchParams {
        scope: "shared".into(),
        page: Some(4),
        page_size: Some(3),
        ..Default::default()
    };
    let result = env
        .service
        .search(query(&axis(0, 0.0)), past_end, &Caller::anonymous())
        .await
        .unwrap();
    assert!(result.hits.is_empty());
}

#[tokio::test]
async fn filters_narrow_the_scope() {
    let env = setup();
    env.upload(
        Upload::image("beach", None, Public, &axis(0, 0.1))
            .tags(&["beach", "summer"])
            .uploaded(day(2024, 1, 10)),
    )
    .await;
    env.upload(
        Upload::image("snow", None, Public, &axis(0, 0.2))
            .tags(&["winter"])
            .uploaded(day(2024, 2, 10)),
    )
    .await;
    env.upload(
        Upload::image("gif", None, Public, &axis(0, 0.3))
            .content_type("image/gif")
            .uploaded(day(2024, 3, 10)),
    )
    .await;

    let anon = Caller::anonymous();
    let run = |filters: SearchFilters| {
        let params = SearchParams {
            scope: "all".into(),
            filters,
            ..Default::default()
        };
        env.service.search(query(&axis(0, 0.0)), params, &anon)
    };

    let tagged = run(SearchFilters {
        tags: Some(vec!["summer".into(), "winter".into()]),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(ids(&tagged), vec!["beach", "snow"]);

    let gifs = run(SearchFilters {
        content_types: Some(vec!["image/gif".into()]),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(ids(&gifs), vec!["gif"]);

    let february = run(SearchFilters {
        uploaded_from: Some(day(2024, 2, 1)),
        uploaded_to: Some(day(2024, 2, 28)),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(ids(&february), vec!["snow"]);

    let empty_lists = run(SearchFilters {
        tags: Some(vec![]),
        content_types: Some(vec![]),
        ..Default::default()
    })
    .await
    .unwrap();
    assert_eq!(empty_lists.total, 3);

    let inverted = run(SearchFilters {
        uploaded_from: Some(day(2024, 3, 1)),
        uploaded_to: Some(day(2024, 1, 1)),
        ..Default::default()
    })
    .await
    .unwrap_err();
    assert!(matches!(inverted, MosaicError::InvalidQuery(_)));
}

#[tokio::test]
async fn text_queries_share_the_image_space() {
    let env = seeded().await;
    let text = String::from_utf8(image_bytes(&axis(0, 0.3))).unwrap();

    let result = env
        .service
        .search(QueryInput::Text(text), scope("shared"), &Caller::anonymous())
        .await
        .unwrap();
    assert_eq!(result.hits[0].media_id, "system");
}

#[tokio::test]
async fn bad_inputs_are_rejected() {
    let env = seeded().await;
    let anon = Caller::anonymous();

    let err = env
        .service
        .search(QueryInput::Text("   ".into()), scope("all"), &anon)
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::EmbeddingExtraction(_)));

    let err = env
        .service
        .search(QueryInput::Image(b"bad jpeg".to_vec()), scope("all"), &anon)
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::EmbeddingExtraction(_)));

    let err = env
        .service
        .search(query(&[1.0, 0.0]), scope("all"), &anon)
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::InvalidQuery(_)));

    let params = SearchParams {
        scope: "all".into(),
        page: Some(0),
        ..Default::default()
    };
    let err = env.service.search(query(&axis(0, 0.0)), params, &anon).await.unwrap_err();
    assert!(matches!(err, MosaicError::InvalidQuery(_)));

    let params = SearchParams {
        scope: "all".into(),
        page_size: Some(1000),
        ..Default::default()
    };
    let err = env.service.search(query(&axis(0, 0.0)), params, &anon).await.unwrap_err();
    assert!(matches!(err, MosaicError::InvalidQuery(_)));
}

#[tokio::test]
async fn deep_pages_are_rejected_before_the_index() {
    let env = seeded().await;
    let anon = Caller::anonymous();
    let page = |page: usize| SearchParams {
        scope: "all".into(),
        page: Some(page),
        page_size: Some(20),
        ..Default::default()
    };

    // Offset overflows usize.
    let err = env
        .service
        .search(query(&axis(0, 0.0)), page(usize::MAX / 10), &anon)
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::InvalidQuery(_)));

    // Past the default window of 10,000 ranks.
    let err = env.service.search(query(&axis(0, 0.0)), page(501), &anon).await.unwrap_err();
    assert!(matches!(err, MosaicError::InvalidQuery(_)));

    let last = env.service.search(query(&axis(0, 0.0)), page(500), &anon).await.unwrap();
    assert!(last.hits.is_empty());
    assert_eq!(last.total, 2);
}

#[tokio::test]
async fn similar_excludes_the_source() {
    let env = seeded().await;

    let result = env
        .service
        .search_similar_to("alice-public", scope("all"), &Caller::user("alice"))
        .await
        .unwrap();
    assert!(!ids(&result).contains(&"alice-public"));
    assert_eq!(result.total, 2);
    assert_eq!(result.hits.len(), 2);
}

#[tokio::test]
async fn similar_to_invisible_media_is_not_found() {
    let env = seeded().await;

    let err = env
        .service
        .search_similar_to("bob-private", scope("all"), &Caller::user("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::MediaNotFound(_)));

    let err = env
        .service
        .search_similar_to("nope", scope("all"), &Caller::user("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, MosaicError::MediaNotFound(_)));
}
