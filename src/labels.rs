// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/labels.rs - 作物病害类别表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 作物种类到病害标签列表的映射。
//!
//! 模型输出的类别编号按位置在所选作物的列表中查找。内置表位于
//! `labels/crops.toml`，也可通过 `--labels` 指定外部文件覆盖。

use std::{collections::BTreeMap, path::Path, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

const BUILTIN_CROPS: &str = include_str!("../labels/crops.toml");

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("类别表解析错误: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("类别表读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("未知的作物种类: {0}")]
  UnknownKind(String),
  #[error("类别编号 {index} 超出作物 {kind} 的标签范围 (共 {len} 类)")]
  OutOfRange {
    kind: String,
    index: u32,
    len: usize,
  },
}

#[derive(Deserialize)]
struct CategoryEntry {
  labels: Vec<String>,
}

/// 单一作物的有序标签列表
#[derive(Debug, Clone)]
pub struct CategorySet {
  kind: String,
  labels: Arc<[String]>,
}

impl CategorySet {
  pub fn kind(&self) -> &str {
    &self.kind
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn label(&self, index: u32) -> Result<&str, LabelError> {
    self
      .labels
      .get(index as usize)
      .map(String::as_str)
      .ok_or_else(|| LabelError::OutOfRange {
        kind: self.kind.clone(),
        index,
        len: self.labels.len(),
      })
  }
}

/// 所有作物的类别表
#[derive(Debug, Clone)]
pub struct CategoryCatalog {
  sets: BTreeMap<String, CategorySet>,
}

impl CategoryCatalog {
  pub fn builtin() -> Result<Self, LabelError> {
    Self::from_toml_str(BUILTIN_CROPS)
  }

  pub fn from_file(path: &Path) -> Result<Self, LabelError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, LabelError> {
    let entries: BTreeMap<String, CategoryEntry> = toml::from_str(content)?;
    let sets = entries
      .into_iter()
      .map(|(kind, entry)| {
        let set = CategorySet {
          kind: kind.clone(),
          labels: entry.labels.into(),
        };
        (kind, set)
      })
      .collect();
    Ok(Self { sets })
  }

  pub fn get(&self, kind: &str) -> Result<&CategorySet, LabelError> {
    self
      .sets
      .get(kind)
      .ok_or_else(|| LabelError::UnknownKind(kind.to_string()))
  }

  pub fn kinds(&self) -> impl Iterator<Item = &str> {
    self.sets.keys().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtin_catalog() {
    let catalog = CategoryCatalog::builtin().unwrap();
    let kinds: Vec<_> = catalog.kinds().collect();
    assert_eq!(kinds, vec!["corn", "rice", "strawberry", "tomato"]);
    assert_eq!(catalog.get("rice").unwrap().len(), 3);
    assert_eq!(catalog.get("corn").unwrap().len(), 4);
    assert_eq!(catalog.get("strawberry").unwrap().len(), 7);
    assert_eq!(catalog.get("tomato").unwrap().len(), 9);
  }

  #[test]
  fn test_label_lookup_is_stable() {
    let catalog = CategoryCatalog::builtin().unwrap();
    let corn = catalog.get("corn").unwrap();
    for _ in 0..3 {
      assert_eq!(corn.label(3).unwrap(), "health（健康）");
      assert_eq!(corn.label(0).unwrap(), "blight（疫病）");
    }
  }

  #[test]
  fn test_label_out_of_range() {
    let catalog = CategoryCatalog::builtin().unwrap();
    let rice = catalog.get("rice").unwrap();
    match rice.label(3) {
      Err(LabelError::OutOfRange { index, len, .. }) => {
        assert_eq!(index, 3);
        assert_eq!(len, 3);
      }
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn test_unknown_kind() {
    let catalog = CategoryCatalog::builtin().unwrap();
    assert!(matches!(
      catalog.get("wheat"),
      Err(LabelError::UnknownKind(kind)) if kind == "wheat"
    ));
  }

  #[test]
  fn test_custom_table() {
    let catalog = CategoryCatalog::from_toml_str("[pear]\nlabels = [\"scab\", \"rust\"]\n").unwrap();
    assert_eq!(catalog.get("pear").unwrap().label(1).unwrap(), "rust");
  }
}
