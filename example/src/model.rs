// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.


//! Data types that represent the entities served by this service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error raised when an entity does not satisfy the invariants of its type.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ModelError(pub String);

/// A project, which groups notes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Project {
    /// Identifier assigned by the store on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Human-readable name of the project.
    pub name: String,
}

impl Project {
    /// Checks that the project can be stored.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError("Project name cannot be empty".to_owned()));
        }
        Ok(())
    }
}

/// A note attached to a project.
#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    /// Identifier assigned by the store on creation.
    pub id: Option<Uuid>,

    /// Project that owns this note.
    pub project: Uuid,

    /// Contents of the note.
    pub text: String,
}

/// Wire representation of a `Note`.
///
/// The owning project is implied by the URL of the request and is not part of the document.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct NoteDto {
    /// Identifier of the note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Contents of the note.
    pub text: String,
}

impl Note {
    /// Converts this note into its wire representation.
    pub fn into_dto(self) -> NoteDto {
        NoteDto { id: self.id, text: self.text }
    }

    /// Builds a note owned by `project` from its wire representation.
    pub fn from_dto(project: Uuid, dto: NoteDto) -> Result<Note, ModelError> {
        if dto.text.len() > 1024 {
            return Err(ModelError("Note text cannot be longer than 1024 bytes".to_owned()));
        }
        Ok(Note { id: dto.id, project, text: dto.text })
    }
}
