//! Startup-time registry mapping request types and file names to recipes.

use std::sync::Arc;

use crate::Result;
use crate::error::Error;
use crate::recipe::{Recipe, RecipeConfig};

/// Ordered set of recipes, searched first-match by file glob.
#[derive(Debug, Default)]
pub struct RecipeBook {
    /// Recipes in matching order.
    recipes: Vec<Arc<Recipe>>,
}

impl RecipeBook {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles every definition, in order.
    pub fn from_configs(configs: &[RecipeConfig]) -> Result<Self> {
        let mut book = Self::new();
        for config in configs {
            book.insert(Recipe::compile(config)?)?;
        }
        Ok(book)
    }

    /// Appends a recipe. Names must be unique.
    pub fn insert(&mut self, recipe: Recipe) -> Result<()> {
        if self.by_name(recipe.name()).is_some() {
            return Err(Error::Recipe {
                name: recipe.name().to_owned(),
                reason: "duplicate recipe name".into(),
            });
        }
        self.recipes.push(Arc::new(recipe));
        Ok(())
    }

    /// Looks a recipe up by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Recipe>> {
        self.recipes.iter().find(|r| r.name() == name).cloned()
    }

    /// First recipe whose file glob matches `filename`.
    pub fn match_file(&self, filename: &str) -> Option<Arc<Recipe>> {
        self.recipes
            .iter()
            .find(|r| r.matches_file(filename))
            .cloned()
    }

    /// Selects the recipe for a request: by name when `recipe_type` is
    /// given, otherwise by file name.
    pub fn select(&self, recipe_type: &str, filename: &str) -> Option<Arc<Recipe>> {
        if recipe_type.is_empty() {
            self.match_file(filename)
        } else {
            self.by_name(recipe_type)
        }
    }

    /// Number of recipes.
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// Whether no recipe is configured.
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> RecipeBook {
        RecipeBook::from_configs(&[
            RecipeConfig::new("c", "*.c", vec!["cc {{.Filename}}".into()], "a.out", 1000),
            RecipeConfig::new("any-c", "*.c", vec!["tcc {{.Filename}}".into()], "a.out", 1000),
            RecipeConfig::new("tex", "*.tex", vec!["pdflatex {{.Filename}}".into()], "*.pdf", 1000),
        ])
        .unwrap()
    }

    #[test]
    fn selects_by_type_then_glob() {
        let book = book();
        assert_eq!(book.len(), 3);
        assert_eq!(book.select("", "main.c").unwrap().name(), "c");
        assert_eq!(book.select("any-c", "main.c").unwrap().name(), "any-c");
        assert_eq!(book.select("", "paper.tex").unwrap().name(), "tex");
        assert!(book.select("", "main.rs").is_none());
        assert!(book.select("rust", "main.c").is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let config = RecipeConfig::new("c", "*.c", vec!["cc x".into()], "a.out", 1000);
        let err = RecipeBook::from_configs(&[config.clone(), config]).unwrap_err();
        assert!(matches!(err, Error::Recipe { .. }));
    }

    #[test]
    fn empty_book_matches_nothing() {
        let book = RecipeBook::new();
        assert!(book.is_empty());
        assert!(book.select("", "main.c").is_none());
    }
}
