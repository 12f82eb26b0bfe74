use sqlx::PgPool;

use crate::{models, se, spotify, Result, LOG};

/// Insert the user if we've never seen this spotify account before,
/// returning the local id either way. Display data is only captured
/// at first login and not updated afterwards.
pub async fn upsert_user(pool: &PgPool, profile: &spotify::Profile) -> Result<i64> {
    // The self-assign on conflict leaves the display columns untouched
    // while making `returning` yield the existing row too, even when
    // two first logins for one account race.
    let id = sqlx::query_scalar::<_, i64>(
        "
        insert into digger.users (spotify_id, display_name, profile_image)
        values ($1, $2, $3)
        on conflict (spotify_id) do update set spotify_id = excluded.spotify_id
        returning id
        ",
    )
    .bind(&profile.id)
    .bind(&profile.display_name)
    .bind(profile.image.as_deref())
    .fetch_one(pool)
    .await
    .map_err(|e| se!("error upserting user {}", e))?;
    slog::debug!(LOG, "upserted user"; "user_id" => id, "spotify_id" => &profile.id);
    Ok(id)
}

pub async fn lookup_user(pool: &PgPool, spotify_id: &str) -> Result<Option<models::User>> {
    sqlx::query_as::<_, models::User>("select * from digger.users where spotify_id = $1")
        .bind(spotify_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| se!("error looking up user {} {}", spotify_id, e))
}

/// Take the per-user advisory lock that all snapshot replaces go
/// through. Postgres holds it until the surrounding transaction ends,
/// so two replaces for the same user never interleave.
async fn lock_user_snapshots(
    tr: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<()> {
    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(user_id)
        .execute(tr)
        .await
        .map_err(|e| se!("error locking user {} snapshots {}", user_id, e))?;
    Ok(())
}

/// Replace the stored top-artist snapshot for a user. The delete and
/// the inserts run in one transaction behind a per-user advisory lock:
/// readers never see a half replaced snapshot, and concurrent replaces
/// for one user serialize instead of merging their rows. Insertion
/// order is the upstream relevance order.
pub async fn replace_top_artists(
    pool: &PgPool,
    user_id: i64,
    artists: &[spotify::Artist],
) -> Result<()> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting artist replace transaction {}", e))?;
    lock_user_snapshots(&mut tr, user_id).await?;
    sqlx::query("delete from digger.user_artists where user_id = $1")
        .bind(user_id)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("error clearing user artists {}", e))?;
    for artist in artists {
        sqlx::query(
            "
            insert into digger.user_artists
            (user_id, artist_name, artist_id, popularity, followers, spotify_url, image_url)
            values ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(user_id)
        .bind(&artist.name)
        .bind(&artist.id)
        .bind(artist.popularity)
        .bind(artist.followers)
        .bind(artist.spotify_url.as_deref())
        .bind(artist.image_url.as_deref())
        .execute(&mut tr)
        .await
        .map_err(|e| se!("error inserting user artist {}", e))?;
    }
    tr.commit()
        .await
        .map_err(|e| se!("error committing artist replace {}", e))?;
    slog::info!(LOG, "replaced top artists"; "user_id" => user_id, "count" => artists.len());
    Ok(())
}

/// Replace the stored top-genre snapshot for a user, under the same
/// transaction and per-user lock contract as the artist replace. Only
/// the genre names are stored; their rank is implicit in insertion order.
pub async fn replace_top_genres(
    pool: &PgPool,
    user_id: i64,
    genres: &[(String, usize)],
) -> Result<()> {
    let mut tr = pool
        .begin()
        .await
        .map_err(|e| se!("error starting genre replace transaction {}", e))?;
    lock_user_snapshots(&mut tr, user_id).await?;
    sqlx::query("delete from digger.user_genres where user_id = $1")
        .bind(user_id)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("error clearing user genres {}", e))?;
    for (genre, _count) in genres {
        sqlx::query("insert into digger.user_genres (user_id, genre_name) values ($1, $2)")
            .bind(user_id)
            .bind(genre)
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error inserting user genre {}", e))?;
    }
    tr.commit()
        .await
        .map_err(|e| se!("error committing genre replace {}", e))?;
    slog::info!(LOG, "replaced top genres"; "user_id" => user_id, "count" => genres.len());
    Ok(())
}

pub async fn user_genres(pool: &PgPool, user_id: i64) -> Result<Vec<models::UserGenre>> {
    sqlx::query_as::<_, models::UserGenre>(
        "select * from digger.user_genres where user_id = $1 order by id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| se!("error fetching user genres {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run against the database named by DATABASE_URL and skip
    // silently when it isn't set.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("failed connecting to DATABASE_URL");
        sqlx::migrate!()
            .run(&pool)
            .await
            .expect("failed running migrations");
        Some(pool)
    }

    fn unique_id(prefix: &str) -> String {
        format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
    }

    fn test_profile(spotify_id: &str, display_name: &str) -> spotify::Profile {
        spotify::Profile {
            id: spotify_id.to_string(),
            display_name: display_name.to_string(),
            email: "N/A".to_string(),
            profile_url: None,
            image: None,
        }
    }

    fn test_artists(n: usize) -> Vec<spotify::Artist> {
        (0..n)
            .map(|i| spotify::Artist {
                name: format!("artist-{}", i),
                id: format!("artist-id-{}", i),
                popularity: 50,
                followers: 1000,
                spotify_url: None,
                image_url: None,
                genres: vec!["rock".to_string()],
            })
            .collect()
    }

    fn test_genres(n: usize) -> Vec<(String, usize)> {
        (0..n).map(|i| (format!("genre-{}", i), n - i)).collect()
    }

    #[async_std::test]
    async fn repeat_logins_keep_first_login_display_data() {
        let pool = match test_pool().await {
            Some(pool) => pool,
            None => return,
        };
        let spotify_id = unique_id("repeat-login");
        let first = upsert_user(&pool, &test_profile(&spotify_id, "Original Name"))
            .await
            .unwrap();
        let second = upsert_user(&pool, &test_profile(&spotify_id, "Renamed"))
            .await
            .unwrap();
        assert_eq!(first, second);
        let user = lookup_user(&pool, &spotify_id).await.unwrap().unwrap();
        assert_eq!(user.display_name, "Original Name");
    }

    #[async_std::test]
    async fn simultaneous_first_logins_converge_on_one_row() {
        let pool = match test_pool().await {
            Some(pool) => pool,
            None => return,
        };
        let spotify_id = unique_id("first-login");
        let a = {
            let pool = pool.clone();
            let profile = test_profile(&spotify_id, "Early Bird");
            async_std::task::spawn(async move { upsert_user(&pool, &profile).await })
        };
        let b = {
            let pool = pool.clone();
            let profile = test_profile(&spotify_id, "Late Bird");
            async_std::task::spawn(async move { upsert_user(&pool, &profile).await })
        };
        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert_eq!(a, b);
        assert!(lookup_user(&pool, &spotify_id).await.unwrap().is_some());
    }

    #[async_std::test]
    async fn concurrent_artist_replaces_leave_one_complete_snapshot() {
        let pool = match test_pool().await {
            Some(pool) => pool,
            None => return,
        };
        let spotify_id = unique_id("artist-race");
        let user_id = upsert_user(&pool, &test_profile(&spotify_id, "Racer"))
            .await
            .unwrap();
        for _ in 0..20 {
            let a = {
                let pool = pool.clone();
                async_std::task::spawn(async move {
                    replace_top_artists(&pool, user_id, &test_artists(10)).await
                })
            };
            let b = {
                let pool = pool.clone();
                async_std::task::spawn(async move {
                    replace_top_artists(&pool, user_id, &test_artists(10)).await
                })
            };
            a.await.unwrap();
            b.await.unwrap();
            let rows = sqlx::query_scalar::<_, i64>(
                "select count(*) from digger.user_artists where user_id = $1",
            )
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(rows, 10);
        }
    }

    #[async_std::test]
    async fn concurrent_genre_replaces_leave_one_complete_snapshot() {
        let pool = match test_pool().await {
            Some(pool) => pool,
            None => return,
        };
        let spotify_id = unique_id("genre-race");
        let user_id = upsert_user(&pool, &test_profile(&spotify_id, "Racer"))
            .await
            .unwrap();
        for _ in 0..20 {
            let a = {
                let pool = pool.clone();
                async_std::task::spawn(async move {
                    replace_top_genres(&pool, user_id, &test_genres(10)).await
                })
            };
            let b = {
                let pool = pool.clone();
                async_std::task::spawn(async move {
                    replace_top_genres(&pool, user_id, &test_genres(10)).await
                })
            };
            a.await.unwrap();
            b.await.unwrap();
            let stored = user_genres(&pool, user_id).await.unwrap();
            let names: Vec<&str> = stored.iter().map(|g| g.genre_name.as_str()).collect();
            let expected: Vec<String> = test_genres(10).into_iter().map(|(g, _)| g).collect();
            assert_eq!(names, expected);
        }
    }
}
