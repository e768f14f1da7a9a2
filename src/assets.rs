use rust_embed::RustEmbed;

/// Embedded database migrations
#[derive(RustEmbed)]
#[folder = "migrations/"]
pub struct MigrationAssets;

impl MigrationAssets {
    /// Get all migration files, ordered by filename
    pub fn get_migrations() -> Vec<(String, String)> {
        let mut migrations = Vec::new();

        for file_path in Self::iter() {
            if let Some(file) = Self::get(&file_path) {
                let content = String::from_utf8_lossy(&file.data).to_string();
                migrations.push((file_path.to_string(), content));
            }
        }

        // Filenames are numbered, so lexical order is application order
        migrations.sort_by(|a, b| a.0.cmp(&b.0));
        migrations
    }
}
