use dust_suballoc::chunk::ChunkHandle;
use dust_suballoc::{BufferConfig, BufferError, HostBuffer};

fn main() {
    dust_log::init();

    let config = match std::env::args().nth(1) {
        Some(path) => BufferConfig::load(&path).unwrap_or_else(|err| {
            tracing::error!(%path, %err, "failed to load buffer config");
            std::process::exit(1);
        }),
        None => BufferConfig::default(),
    };
    let mut buffer = HostBuffer::new(config).unwrap_or_else(|err| {
        tracing::error!(%err, "failed to create host buffer");
        std::process::exit(1);
    });

    if let Err(err) = run(&mut buffer) {
        tracing::error!(%err, "demo failed");
        std::process::exit(1);
    }
}

fn run(buffer: &mut HostBuffer) -> Result<(), BufferError> {
    let initial = buffer.config().initial_size;
    let block = (initial / 8).max(1);

    let meshes: Vec<ChunkHandle> = (0..6)
        .map(|_| buffer.allocate(block))
        .collect::<Result<_, _>>()?;
    for (i, &mesh) in meshes.iter().enumerate() {
        buffer.write(mesh, 0, &[i as u8 + 1; 16][..block.min(16) as usize])?;
    }
    let lod = buffer.allocate_in(meshes[0], (block / 4).max(1))?;
    buffer.write(lod, 0, b"lod0")?;
    tracing::info!(stats = ?buffer.stats()?, "allocated meshes");

    for &mesh in meshes.iter().skip(1).step_by(2) {
        buffer.free(mesh)?;
    }
    let stats = buffer.stats()?;
    tracing::info!(
        fragmentation = stats.fragmentation(),
        ?stats,
        "freed every other mesh"
    );

    let resize = buffer.resize(meshes[0], block * 3)?;
    tracing::info!(?resize, chunk = ?buffer.chunk(meshes[0])?, "resized first mesh");

    match buffer.allocate(initial) {
        Ok(big) => tracing::info!(
            capacity = buffer.capacity(),
            chunk = ?buffer.chunk(big)?,
            "allocated past initial size"
        ),
        Err(err) if err.is_out_of_space() => tracing::warn!(%err, "buffer is at its size limit"),
        Err(err) => return Err(err),
    }

    let relocations = buffer.defragment()?;
    let stats = buffer.stats()?;
    tracing::info!(
        moved = relocations.len(),
        fragmentation = stats.fragmentation(),
        ?stats,
        "defragmented"
    );
    let payload = buffer.read(lod)?;
    let payload = String::from_utf8_lossy(&payload[..payload.len().min(4)]);
    tracing::info!(%payload, chunk = ?buffer.chunk(lod)?, "nested chunk after compaction");

    let dirty = buffer.drain_dirty();
    tracing::info!(ranges = dirty.len(), ?dirty, "dirty ranges to upload");
    Ok(())
}
