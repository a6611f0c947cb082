//! # Módulo de Carregamento - Leitura de Arquivos do Disco
//!
//! Lê definições de operação e descritores de relação, em JSON ou YAML,
//! e converte tudo para `serde_json::Value` antes da validação tipada.
//!
//! ## O que este módulo faz?
//!
//! 1. Lê o conteúdo de um arquivo do sistema de arquivos
//! 2. Escolhe o parser pela extensão (`.yaml`/`.yml` → YAML, resto → JSON)
//! 3. Retorna erros com contexto (qual arquivo, qual etapa)
//!
//! A validação do conteúdo fica com `catalog` e `relations`: aqui só
//! garantimos que o arquivo existe e é sintaticamente válido.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Extensões reconhecidas como arquivos de definição.
const DOCUMENT_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Formato de um documento, decidido pela extensão ou pelo conteúdo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Formato pela extensão do arquivo. Sem extensão conhecida, `None`.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("json") => Some(Self::Json),
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Adivinha o formato pelo primeiro caractere relevante.
    pub fn sniff(content: &str) -> Self {
        match content.trim_start().chars().next() {
            Some('{') | Some('[') => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parseia texto JSON ou YAML para um `Value`.
pub fn parse_document(content: &str, format: DocumentFormat) -> Result<Value> {
    let value = match format {
        DocumentFormat::Json => {
            serde_json::from_str(content).context("Failed to parse JSON document")?
        }
        DocumentFormat::Yaml => {
            serde_yaml::from_str(content).context("Failed to parse YAML document")?
        }
    };
    Ok(value)
}

/// Carrega um documento do disco.
///
/// ## Exemplos de erro:
/// - "Failed to read document" → arquivo não existe ou sem permissão
/// - "Failed to parse YAML document" → sintaxe inválida
pub fn load_document_from_file<P: AsRef<Path>>(path: P) -> Result<Value> {
    let path_ref = path.as_ref();

    let content = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read document {:?}", path_ref))?;

    let format = DocumentFormat::from_path(path_ref).unwrap_or_else(|| DocumentFormat::sniff(&content));

    parse_document(&content, format).with_context(|| format!("Invalid document {:?}", path_ref))
}

/// Lista os arquivos de definição de um diretório, em ordem alfabética.
///
/// A ordem fixa garante que duas execuções sobre o mesmo diretório
/// carregam o catálogo da mesma forma.
pub fn list_definition_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir_ref = dir.as_ref();
    let entries = fs::read_dir(dir_ref)
        .with_context(|| format!("Failed to read operations directory {:?}", dir_ref))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to list {:?}", dir_ref))?
            .path();
        let is_document = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DOCUMENT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_document {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Normaliza um nome de arquivo para id de operação.
///
/// O descritor de relações usa nomes de arquivo como identificadores
/// (`create_user.yaml`); o catálogo usa o mesmo nome sem diretório e sem
/// extensão de documento. Exemplo: `specs/create_user.yaml` → `create_user`.
pub fn operation_id_from_file(name: &str) -> String {
    let trimmed = name.trim();
    let file_name = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed);

    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && DOCUMENT_EXTENSIONS.contains(&ext.to_lowercase().as_str()) =>
        {
            stem.to_string()
        }
        _ => file_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_operation_id_from_file() {
        assert_eq!(operation_id_from_file("create_user.yaml"), "create_user");
        assert_eq!(operation_id_from_file("specs/get_user.JSON"), "get_user");
        assert_eq!(operation_id_from_file("dir\\delete_user.yml"), "delete_user");
        assert_eq!(operation_id_from_file("plain_id"), "plain_id");
        assert_eq!(operation_id_from_file("v1.2"), "v1.2");
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(DocumentFormat::sniff("  {\"a\": 1}"), DocumentFormat::Json);
        assert_eq!(DocumentFormat::sniff("openapi: 3.0.0"), DocumentFormat::Yaml);
    }

    #[test]
    fn test_load_yaml_and_json_documents() {
        let temp = TempDir::new().unwrap();
        let yaml_path = temp.path().join("a.yaml");
        let json_path = temp.path().join("b.json");
        fs::File::create(&yaml_path)
            .unwrap()
            .write_all(b"method: GET\npath: /a\n")
            .unwrap();
        fs::write(&json_path, r#"{"method": "POST", "path": "/b"}"#).unwrap();

        let yaml = load_document_from_file(&yaml_path).unwrap();
        let json = load_document_from_file(&json_path).unwrap();

        assert_eq!(yaml["method"], "GET");
        assert_eq!(json["path"], "/b");
    }

    #[test]
    fn test_load_missing_file_mentions_path() {
        let err = load_document_from_file("/definitely/not/here.json").unwrap_err();
        assert!(format!("{:#}", err).contains("here.json"));
    }

    #[test]
    fn test_list_definition_files_is_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        for name in ["b.yaml", "a.json", "notes.txt", "c.yml"] {
            fs::write(temp.path().join(name), "{}").unwrap();
        }

        let files = list_definition_files(temp.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["a.json", "b.yaml", "c.yml"]);
    }
}
